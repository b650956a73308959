//! Server configuration loaded from a line-oriented `key=value` file.
//!
//! All keys are consumed once at startup; the database password is prompted
//! interactively and never stored in the file.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: could not convert config file entry \"{key}\" (=\"{value}\") to {expected}")]
    BadValue {
        path: String,
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("{path}: missing config file entry \"{key}\"")]
    Missing { path: String, key: String },
}

/// Database connection settings.
#[derive(Debug, Clone, Default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub name: String,
    pub password: String,
}

/// Settings for the command-and-control endpoint.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub port: u16,
    pub allowed_clients: String,
    pub logs_deletable: bool,
    pub data_deletable: bool,
}

/// The full startup configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub server: ServerSettings,
}

impl Settings {
    /// Load settings from a `key=value` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;

        let mut values = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let get = |key: &str| values.get(key).cloned().unwrap_or_default();
        let require = |key: &str| -> Result<String, ConfigError> {
            match values.get(key) {
                Some(v) if !v.is_empty() => Ok(v.clone()),
                _ => Err(ConfigError::Missing {
                    path: display.clone(),
                    key: key.to_string(),
                }),
            }
        };
        let parse_u16 = |key: &str, value: String| -> Result<u16, ConfigError> {
            value.parse().map_err(|_| ConfigError::BadValue {
                path: display.clone(),
                key: key.to_string(),
                value,
                expected: "numeric value",
            })
        };
        let parse_bool = |key: &str, value: String| -> Result<bool, ConfigError> {
            if value.is_empty() {
                return Ok(false);
            }
            match value.as_str() {
                "1" | "true" => Ok(true),
                "0" | "false" => Ok(false),
                _ => Err(ConfigError::BadValue {
                    path: display.clone(),
                    key: key.to_string(),
                    value,
                    expected: "boolean value",
                }),
            }
        };

        Ok(Settings {
            database: DatabaseSettings {
                host: get("db_host"),
                port: parse_u16("db_port", require("db_port")?)?,
                user: get("db_user"),
                name: require("db_name")?,
                password: String::new(),
            },
            server: ServerSettings {
                port: parse_u16("server_port", require("server_port")?)?,
                allowed_clients: get("server_allow"),
                logs_deletable: parse_bool("server_logs_deletable", get("server_logs_deletable"))?,
                data_deletable: parse_bool("server_data_deletable", get("server_data_deletable"))?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn parses_full_config() {
        let file = write_config(
            "db_host=localhost\ndb_port=3306\ndb_user=acquire\ndb_name=acquire\n\
             server_port=8080\nserver_allow=127.0.0.1,10.0.0.2\nserver_logs_deletable=true\n",
        );
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.database.port, 3306);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.allowed_clients, "127.0.0.1,10.0.0.2");
        assert!(settings.server.logs_deletable);
        // missing boolean defaults to false
        assert!(!settings.server.data_deletable);
    }

    #[test]
    fn rejects_bad_port() {
        let file = write_config("db_port=not_a_port\ndb_name=x\nserver_port=8080\n");
        assert!(matches!(
            Settings::load(file.path()),
            Err(ConfigError::BadValue { .. })
        ));
    }

    #[test]
    fn rejects_bad_boolean() {
        let file = write_config(
            "db_port=1\ndb_name=x\nserver_port=8080\nserver_data_deletable=maybe\n",
        );
        assert!(matches!(
            Settings::load(file.path()),
            Err(ConfigError::BadValue { .. })
        ));
    }
}
