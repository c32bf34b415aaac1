// Configuration module for odoo-lens
// Reads from environment variables with sensible defaults

use log::warn;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Container running the runtime shell (ODOO_CONTAINER_NAME)
    pub container_name: String,

    /// Container used for the static source scan (ODOO_WEB_CONTAINER)
    pub scan_container: String,

    /// Database the runtime shell boots against (ODOO_DB_NAME)
    pub database: String,

    /// Container exec client (ODOO_EXEC_BINARY)
    pub exec_binary: String,

    /// Runtime shell entry point inside the container (ODOO_SHELL_COMMAND)
    pub shell_command: String,

    /// Generic interpreter inside the container (ODOO_PYTHON)
    pub python: String,

    /// Source roots scanned by the static indexer (ODOO_ADDONS_PATH)
    pub addons_path: Vec<String>,

    /// Live execution timeout in seconds (ODOO_EXEC_TIMEOUT_SECS)
    pub exec_timeout_secs: u64,

    /// Static scan timeout in seconds (ODOO_SCAN_TIMEOUT_SECS)
    pub scan_timeout_secs: u64,

    /// Hard response budget in estimated tokens (ODOO_MAX_TOKENS)
    pub max_tokens: usize,

    /// Soft response budget in estimated tokens (ODOO_WARN_TOKENS)
    pub warn_tokens: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            container_name: "odoo-script-runner-1".to_string(),
            scan_container: "odoo-script-runner-1".to_string(),
            database: "odoo".to_string(),
            exec_binary: "docker".to_string(),
            shell_command: "/odoo/odoo-bin shell".to_string(),
            python: "python3".to_string(),
            addons_path: split_list("/opt/project/addons,/odoo/addons,/volumes/enterprise"),
            exec_timeout_secs: 30,
            scan_timeout_secs: 120,
            max_tokens: 25_000,
            warn_tokens: 20_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(val) = env::var("ODOO_CONTAINER_NAME") {
            if !val.trim().is_empty() {
                config.container_name = val.trim().to_string();
                config.scan_container = config.container_name.clone();
            }
        }
        if let Ok(val) = env::var("ODOO_WEB_CONTAINER") {
            if !val.trim().is_empty() {
                config.scan_container = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("ODOO_DB_NAME") {
            if !val.trim().is_empty() {
                config.database = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("ODOO_EXEC_BINARY") {
            if !val.trim().is_empty() {
                config.exec_binary = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("ODOO_SHELL_COMMAND") {
            if !val.trim().is_empty() {
                config.shell_command = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("ODOO_PYTHON") {
            if !val.trim().is_empty() {
                config.python = val.trim().to_string();
            }
        }
        if let Ok(val) = env::var("ODOO_ADDONS_PATH") {
            let roots = split_list(&val);
            if !roots.is_empty() {
                config.addons_path = roots;
            }
        }

        parse_var("ODOO_EXEC_TIMEOUT_SECS", &mut config.exec_timeout_secs);
        parse_var("ODOO_SCAN_TIMEOUT_SECS", &mut config.scan_timeout_secs);
        parse_var("ODOO_MAX_TOKENS", &mut config.max_tokens);
        parse_var("ODOO_WARN_TOKENS", &mut config.warn_tokens);

        if config.warn_tokens > config.max_tokens {
            warn!(
                "odoo-lens: ODOO_WARN_TOKENS ({}) exceeds ODOO_MAX_TOKENS ({}), clamping",
                config.warn_tokens, config.max_tokens
            );
            config.warn_tokens = config.max_tokens;
        }

        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}

fn parse_var<T: FromStr + Display>(key: &str, slot: &mut T) {
    if let Ok(val) = env::var(key) {
        match val.trim().parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(
                "odoo-lens: Invalid {} value: {}, using default: {}",
                key, val, slot
            ),
        }
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.container_name, "odoo-script-runner-1");
        assert_eq!(config.database, "odoo");
        assert_eq!(config.exec_timeout(), Duration::from_secs(30));
        assert_eq!(config.scan_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_tokens, 25_000);
        assert_eq!(config.addons_path.len(), 3);
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(split_list(" /a , ,/b,"), vec!["/a", "/b"]);
        assert!(split_list("").is_empty());
    }
}
