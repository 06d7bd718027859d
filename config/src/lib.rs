//! Layered environment configuration for Capstan deployments.
//!
//! Values flow into the process environment from two optional sources, with
//! priority **existing env > project `.env` > XDG `config.toml`**. The engine
//! itself then reads plain environment variables (`CAPSTAN_*`), so every
//! knob can be set per-machine (XDG), per-project (.env), or per-invocation
//! (real env) without the engine knowing which layer it came from.

mod dotenv;
mod xdg_toml;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("xdg config dir unavailable")]
    XdgDirUnavailable,
    #[error("read xdg config: {0}")]
    XdgRead(std::io::Error),
    #[error("parse xdg toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads both layers and sets environment variables for keys that are **not**
/// already present in the process environment.
///
/// When a key is missing from the environment, the first layer that defines it
/// wins:
/// 1. Project `.env` (current directory, or `override_dir` when given).
/// 2. `$XDG_CONFIG_HOME/<app_name>/config.toml`, `[env]` table.
///
/// Missing files are not an error; both layers are optional.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg_toml::load_env_map(app_name)?;
    let dotenv_map = dotenv::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::HashSet<String> = xdg_map.keys().cloned().collect();
    keys.extend(dotenv_map.keys().cloned());

    for key in keys {
        if std::env::var(&key).is_ok() {
            continue; // existing env wins
        }
        let value = dotenv_map.get(&key).or_else(|| xdg_map.get(&key)).cloned();
        if let Some(v) = value {
            std::env::set_var(&key, v);
        }
    }

    Ok(())
}
