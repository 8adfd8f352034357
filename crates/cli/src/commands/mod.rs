//! Subcommand implementations.

pub mod dev;
pub mod migrate;
pub mod secret;
pub mod settings;

/// Read a non-empty variable after loading `.env`.
fn env_var(key: &str) -> Option<String> {
    dotenvy::dotenv().ok();
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
