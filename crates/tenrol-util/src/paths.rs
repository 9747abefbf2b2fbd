//! Default paths for tenrol components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/tenrold/tenrold.sock` or `/tmp/tenrold-$USER/tenrold.sock`
//! - Config: `$XDG_CONFIG_HOME/tenrol/config.toml` or `~/.config/tenrol/config.toml`
//! - Data: `$XDG_DATA_HOME/tenrold` or `~/.local/share/tenrold`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const TENROL_SOCKET_ENV: &str = "TENROL_SOCKET";

/// Environment variable for overriding the data directory
pub const TENROL_DATA_DIR_ENV: &str = "TENROL_DATA_DIR";

const SOCKET_FILENAME: &str = "tenrold.sock";

const APP_DIR: &str = "tenrold";

const CONFIG_DIR: &str = "tenrol";

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$TENROL_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/tenrold/tenrold.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/tenrold-$USER/tenrold.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(TENROL_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Get the socket path without checking the TENROL_SOCKET env var.
/// Used for default values in configs where the env var is checked separately.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory.
///
/// Order of precedence:
/// 1. `$TENROL_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/tenrold` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/tenrold` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(TENROL_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Get the data directory without checking the TENROL_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(CONFIG_DIR).join("config.toml");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR)
            .join("config.toml");
    }

    PathBuf::from("/etc").join(CONFIG_DIR).join("config.toml")
}
