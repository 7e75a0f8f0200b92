// src/services/mod.rs

pub mod access;
pub mod activity;
pub mod scoring;
pub mod session;
pub mod timer;
