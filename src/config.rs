use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_OPERATORS;

/// Server settings, read from `SLOTBOOK_*` environment variables.
///
/// A variable that is unset or does not parse falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    /// Connection user names allowed to run privileged statements.
    pub operators: Vec<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(5000),
            operators: Vec::new(),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            port: parse_var(&lookup, "SLOTBOOK_PORT").unwrap_or(defaults.port),
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "SLOTBOOK_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            lock_timeout: parse_var(&lookup, "SLOTBOOK_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            operators: lookup("SLOTBOOK_OPERATORS")
                .map(|s| parse_operators(&s))
                .unwrap_or_default(),
            tls_cert: lookup("SLOTBOOK_TLS_CERT"),
            tls_key: lookup("SLOTBOOK_TLS_KEY"),
            metrics_port: parse_var(&lookup, "SLOTBOOK_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn parse_operators(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if out.len() == MAX_OPERATORS {
            tracing::warn!("SLOTBOOK_OPERATORS: ignoring names past the first {MAX_OPERATORS}");
            break;
        }
        if !out.iter().any(|o| o == name) {
            out.push(name.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(from_pairs(&[]), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let c = from_pairs(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_PASSWORD", "secret"),
            ("SLOTBOOK_MAX_CONNECTIONS", "8"),
            ("SLOTBOOK_COMPACT_THRESHOLD", "50"),
            ("SLOTBOOK_LOCK_TIMEOUT_MS", "250"),
            ("SLOTBOOK_OPERATORS", "alice, bob"),
            ("SLOTBOOK_TLS_CERT", "cert.pem"),
            ("SLOTBOOK_TLS_KEY", "key.pem"),
            ("SLOTBOOK_METRICS_PORT", "9090"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.bind, "127.0.0.1");
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotbook/slotbook.wal"));
        assert_eq!(c.password, "secret");
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.compact_threshold, 50);
        assert_eq!(c.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.operators, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(c.tls_cert.as_deref(), Some("cert.pem"));
        assert_eq!(c.tls_key.as_deref(), Some("key.pem"));
        assert_eq!(c.metrics_port, Some(9090));
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let c = from_pairs(&[("SLOTBOOK_PORT", "lots"), ("SLOTBOOK_LOCK_TIMEOUT_MS", "-1")]);
        assert_eq!(c.port, 5433);
        assert_eq!(c.lock_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn operator_list_skips_blanks_and_duplicates() {
        assert_eq!(parse_operators(" ,admin,,admin , ops "), vec!["admin", "ops"]);
        let many: Vec<String> = (0..MAX_OPERATORS + 5).map(|i| format!("op{i}")).collect();
        assert_eq!(parse_operators(&many.join(",")).len(), MAX_OPERATORS);
    }
}
