use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::DEFAULT_MAX_CONNECTIONS;

/// Server settings, read from `FARMSLOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let password = get("FARMSLOT_PASSWORD").ok_or(ConfigError::Missing("FARMSLOT_PASSWORD"))?;
        let tls_cert = get("FARMSLOT_TLS_CERT");
        let tls_key = get("FARMSLOT_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Invalid {
                key: "FARMSLOT_TLS_CERT",
                value: String::new(),
                reason: "FARMSLOT_TLS_CERT and FARMSLOT_TLS_KEY must be set together",
            });
        }

        let max_connections = parse_or(&get, "FARMSLOT_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "FARMSLOT_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1",
            });
        }

        Ok(Self {
            bind: get("FARMSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "FARMSLOT_PORT", 5433)?,
            data_dir: get("FARMSLOT_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password,
            max_connections,
            metrics_port: get("FARMSLOT_METRICS_PORT")
                .map(|v| parse_value("FARMSLOT_METRICS_PORT", v))
                .transpose()?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("farmslot.wal")
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(v) => parse_value(key, v),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value,
        reason: "not a valid number",
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "{key} must be set"),
            ConfigError::Invalid { key, value, reason } => {
                write!(f, "invalid {key}={value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[("FARMSLOT_PASSWORD", "hunter2")]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.wal_path(), PathBuf::from("./data/farmslot.wal"));
        assert_eq!(c.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.tls_cert, None);
    }

    #[test]
    fn password_is_required() {
        assert_eq!(config(&[]), Err(ConfigError::Missing("FARMSLOT_PASSWORD")));
        assert_eq!(
            config(&[("FARMSLOT_PASSWORD", "")]),
            Err(ConfigError::Missing("FARMSLOT_PASSWORD"))
        );
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("FARMSLOT_PASSWORD", "pw"),
            ("FARMSLOT_BIND", "127.0.0.1"),
            ("FARMSLOT_PORT", "6000"),
            ("FARMSLOT_DATA_DIR", "/var/lib/farmslot"),
            ("FARMSLOT_MAX_CONNECTIONS", "8"),
            ("FARMSLOT_METRICS_PORT", "9100"),
            ("FARMSLOT_TLS_CERT", "cert.pem"),
            ("FARMSLOT_TLS_KEY", "key.pem"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/farmslot/farmslot.wal"));
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(c.tls_key.as_deref(), Some("key.pem"));
    }

    #[test]
    fn bad_numbers_are_errors_not_defaults() {
        let err = config(&[("FARMSLOT_PASSWORD", "pw"), ("FARMSLOT_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FARMSLOT_PORT", .. }));

        let err = config(&[("FARMSLOT_PASSWORD", "pw"), ("FARMSLOT_METRICS_PORT", "70000")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FARMSLOT_METRICS_PORT", .. }));

        let err = config(&[("FARMSLOT_PASSWORD", "pw"), ("FARMSLOT_MAX_CONNECTIONS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FARMSLOT_MAX_CONNECTIONS", .. }));
    }

    #[test]
    fn tls_needs_both_files() {
        let err = config(&[("FARMSLOT_PASSWORD", "pw"), ("FARMSLOT_TLS_KEY", "key.pem")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "FARMSLOT_TLS_CERT", .. }));
    }
}
