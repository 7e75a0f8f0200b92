// src/config.rs

use std::env;
use dotenvy::dotenv;

/// Default lifetime of an attempt token, in seconds.
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 300;

/// Largest accepted `TOKEN_TTL_SECONDS`; anything above falls back to the default.
pub const MAX_TOKEN_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// HMAC secret shared by learner bearer tokens and attempt tokens.
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    /// JSON file holding the evaluation definitions served by this instance.
    pub evaluations_path: String,
    pub bind_addr: String,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let token_ttl_seconds = env::var("TOKEN_TTL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ttl| (1..=MAX_TOKEN_TTL_SECONDS).contains(ttl))
            .unwrap_or(DEFAULT_TOKEN_TTL_SECONDS);

        let evaluations_path = env::var("EVALUATIONS_PATH")
            .unwrap_or_else(|_| "evaluations.json".to_string());

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        Self {
            database_url,
            jwt_secret,
            token_ttl_seconds,
            evaluations_path,
            bind_addr,
            rust_log,
        }
    }
}
