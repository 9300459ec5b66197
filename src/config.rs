use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_LOCK_WAIT_MS;

/// Server settings, read from `ROOMBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub lock_wait: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            user: "roombook".into(),
            password: "roombook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or unparsable numbers keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&lookup, "ROOMBOOK_PORT").unwrap_or(d.port),
            bind: lookup("ROOMBOOK_BIND").unwrap_or(d.bind),
            data_dir: lookup("ROOMBOOK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            user: lookup("ROOMBOOK_USER").unwrap_or(d.user),
            password: lookup("ROOMBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "ROOMBOOK_MAX_CONNECTIONS")
                .filter(|&n: &usize| n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "ROOMBOOK_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            lock_wait: parsed(&lookup, "ROOMBOOK_LOCK_WAIT_MS")
                .map_or(d.lock_wait, Duration::from_millis),
            metrics_port: parsed(&lookup, "ROOMBOOK_METRICS_PORT"),
            tls_cert: lookup("ROOMBOOK_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("ROOMBOOK_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| parse_trimmed(&v))
}

fn parse_trimmed<T: FromStr>(raw: &str) -> Option<T> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = from_pairs(&[]);
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.lock_wait, Duration::from_millis(5000));
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/roombook.wal"));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from_pairs(&[
            ("ROOMBOOK_PORT", "6000"),
            ("ROOMBOOK_BIND", "127.0.0.1"),
            ("ROOMBOOK_DATA_DIR", "/var/lib/roombook"),
            ("ROOMBOOK_LOCK_WAIT_MS", " 250 "),
            ("ROOMBOOK_METRICS_PORT", "9100"),
            ("ROOMBOOK_TLS_CERT", "cert.pem"),
        ]);
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/roombook/roombook.wal"));
        assert_eq!(cfg.lock_wait, Duration::from_millis(250));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.tls_cert, Some(PathBuf::from("cert.pem")));
        assert_eq!(cfg.tls_key, None);
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let cfg = from_pairs(&[
            ("ROOMBOOK_PORT", "eighty"),
            ("ROOMBOOK_MAX_CONNECTIONS", "0"),
            ("ROOMBOOK_COMPACT_THRESHOLD", "-1"),
            ("ROOMBOOK_METRICS_PORT", "99999"),
        ]);
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn each_setting_parses_to_its_own_type() {
        let cfg = from_pairs(&[
            ("ROOMBOOK_PORT", "7000"),
            ("ROOMBOOK_MAX_CONNECTIONS", "12"),
            ("ROOMBOOK_COMPACT_THRESHOLD", "5000000000"),
            ("ROOMBOOK_LOCK_WAIT_MS", "40"),
            ("ROOMBOOK_USER", "frontdesk"),
        ]);
        assert_eq!(cfg.port, 7000u16);
        assert_eq!(cfg.max_connections, 12usize);
        assert_eq!(cfg.compact_threshold, 5_000_000_000u64);
        assert_eq!(cfg.lock_wait, Duration::from_millis(40));
        assert_eq!(cfg.user, "frontdesk");
    }
}
