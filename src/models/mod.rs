// src/models/mod.rs

pub mod access_record;
pub mod attempt;
pub mod evaluation;
