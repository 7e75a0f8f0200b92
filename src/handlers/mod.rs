// src/handlers/mod.rs

pub mod access;
pub mod session;
