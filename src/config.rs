//! Runtime settings
//!
//! Settings come from the process environment. A dotenv file is read first
//! (`bankgreen/.env`, then `.env` in the working directory) so deployments
//! can keep secrets out of the repository; variables already present in the
//! environment win over the file.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATABASE: &str = "db.sqlite3";
pub const DEFAULT_ADDR: &str = "0.0.0.0:8000";

/// Page size of the page-number paginated endpoints
pub const DEFAULT_PAGE_SIZE: usize = 1;

/// Lets clients pull every brand in a single connection query
pub const DEFAULT_CONNECTION_MAX_LIMIT: usize = 10_000;

/// Upper bound for ids accepted by one admin bulk action
pub const DEFAULT_BULK_ACTION_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub secret_key: Option<String>,
    pub debug: bool,
    pub allowed_hosts: Vec<String>,
    pub calendar_url: Option<String>,

    pub username: Option<String>,
    pub password: Option<String>,
    /// Bearer token for the admin endpoints; admin is closed when unset
    pub token: Option<String>,

    pub cors_allowed_origin_regexes: Vec<Regex>,
    pub cache_max_age: Option<u64>,

    pub database_path: PathBuf,
    pub bind_addr: String,

    pub page_size: usize,
    pub connection_max_limit: usize,
    pub bulk_action_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            secret_key: None,
            debug: false,
            allowed_hosts: Vec::new(),
            calendar_url: None,
            username: None,
            password: None,
            token: None,
            cors_allowed_origin_regexes: Vec::new(),
            cache_max_age: None,
            database_path: PathBuf::from(DEFAULT_DATABASE),
            bind_addr: DEFAULT_ADDR.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            connection_max_limit: DEFAULT_CONNECTION_MAX_LIMIT,
            bulk_action_limit: DEFAULT_BULK_ACTION_LIMIT,
        }
    }
}

impl Settings {
    /// Load settings from dotenv files and the process environment.
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        Self::from_vars(std::env::vars())
    }

    /// Build settings from an explicit set of variables.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let debug = get("DEBUG") == Some("True");
        let secret_key = get("SECRET_KEY").map(str::to_string);

        if !debug && secret_key.is_none() {
            return Err(Error::Config(
                "SECRET_KEY must be set when DEBUG is not True".to_string(),
            ));
        }

        let cors_allowed_origin_regexes = split_spaces(get("CORS_ALLOWED_ORIGIN_REGEXES"))
            .into_iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    Error::Config(format!("invalid CORS origin regex '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cache_max_age = get("CACHE_MAX_AGE")
            .map(|v| parse_number::<u64>("CACHE_MAX_AGE", v))
            .transpose()?;

        let page_size = get("PAGE_SIZE")
            .map(|v| parse_number::<usize>("PAGE_SIZE", v))
            .transpose()?
            .unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(Error::Config("PAGE_SIZE must be at least 1".to_string()));
        }

        let connection_max_limit = get("RELAY_CONNECTION_MAX_LIMIT")
            .map(|v| parse_number::<usize>("RELAY_CONNECTION_MAX_LIMIT", v))
            .transpose()?
            .unwrap_or(DEFAULT_CONNECTION_MAX_LIMIT);

        let bulk_action_limit = get("DATA_UPLOAD_MAX_NUMBER_FIELDS")
            .map(|v| parse_number::<usize>("DATA_UPLOAD_MAX_NUMBER_FIELDS", v))
            .transpose()?
            .unwrap_or(DEFAULT_BULK_ACTION_LIMIT);

        Ok(Settings {
            secret_key,
            debug,
            allowed_hosts: split_spaces(get("ALLOWED_HOSTS")),
            calendar_url: get("CALENDAR_URL").map(str::to_string),
            username: get("USERNAME").map(str::to_string),
            password: get("PASSWORD").map(str::to_string),
            token: get("TOKEN").map(str::to_string),
            cors_allowed_origin_regexes,
            cache_max_age,
            database_path: get("BANKGREEN_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE)),
            bind_addr: get("BANKGREEN_ADDR").unwrap_or(DEFAULT_ADDR).to_string(),
            page_size,
            connection_max_limit,
            bulk_action_limit,
        })
    }

    /// Check a `Host` header value against `allowed_hosts`.
    pub fn host_allowed(&self, host: &str) -> bool {
        let host = strip_port(host).to_lowercase();
        if host.is_empty() {
            return false;
        }

        if self.allowed_hosts.is_empty() {
            return self.debug && matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]");
        }

        self.allowed_hosts.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            if pattern == "*" {
                true
            } else if let Some(domain) = pattern.strip_prefix('.') {
                host == domain || host.ends_with(&pattern)
            } else {
                host == pattern
            }
        })
    }

    /// Check a request `Origin` against the configured CORS regexes.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.cors_allowed_origin_regexes
            .iter()
            .any(|re| re.is_match(origin))
    }
}

/// Read `bankgreen/.env`, else `.env`, into the process environment.
/// Variables already set are kept. The binaries call this before logging
/// starts so `RUST_LOG` from the file applies.
pub fn load_dotenv() {
    load_dotenv_from(Path::new("."));
}

fn load_dotenv_from(dir: &Path) -> Option<PathBuf> {
    [dir.join("bankgreen").join(".env"), dir.join(".env")]
        .into_iter()
        .find(|path| dotenv::from_path(path).is_ok())
}

fn split_spaces(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        Settings::from_vars(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_defaults_in_debug() {
        let s = settings(&[("DEBUG", "True")]).unwrap();

        assert!(s.debug);
        assert!(s.allowed_hosts.is_empty());
        assert_eq!(s.page_size, 1);
        assert_eq!(s.connection_max_limit, 10_000);
        assert_eq!(s.bulk_action_limit, 10_000);
        assert_eq!(s.database_path, PathBuf::from("db.sqlite3"));
        assert!(s.cache_max_age.is_none());
    }

    #[test]
    fn test_debug_requires_exact_true() {
        let s = settings(&[("DEBUG", "true"), ("SECRET_KEY", "x")]).unwrap();
        assert!(!s.debug);
    }

    #[test]
    fn test_secret_key_required_outside_debug() {
        let err = settings(&[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_space_separated_lists() {
        let s = settings(&[
            ("SECRET_KEY", "s3cret"),
            ("ALLOWED_HOSTS", "bank.green  api.bank.green"),
            ("CORS_ALLOWED_ORIGIN_REGEXES", r"https://.*\.bank\.green http://localhost:\d+"),
            ("CACHE_MAX_AGE", "600"),
        ])
        .unwrap();

        assert_eq!(s.allowed_hosts, vec!["bank.green", "api.bank.green"]);
        assert_eq!(s.cors_allowed_origin_regexes.len(), 2);
        assert_eq!(s.cache_max_age, Some(600));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        assert!(matches!(
            settings(&[("DEBUG", "True"), ("CORS_ALLOWED_ORIGIN_REGEXES", "(")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            settings(&[("DEBUG", "True"), ("CACHE_MAX_AGE", "soon")]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            settings(&[("DEBUG", "True"), ("PAGE_SIZE", "0")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_host_allowed() {
        let s = settings(&[
            ("SECRET_KEY", "s"),
            ("ALLOWED_HOSTS", "bank.green .example.org"),
        ])
        .unwrap();

        assert!(s.host_allowed("bank.green"));
        assert!(s.host_allowed("BANK.green:443"));
        assert!(s.host_allowed("example.org"));
        assert!(s.host_allowed("api.example.org"));
        assert!(!s.host_allowed("evil.com"));
        assert!(!s.host_allowed("notexample.org"));
        assert!(!s.host_allowed("localhost"));
    }

    #[test]
    fn test_debug_allows_localhost_when_hosts_empty() {
        let s = settings(&[("DEBUG", "True")]).unwrap();

        assert!(s.host_allowed("localhost:8000"));
        assert!(s.host_allowed("127.0.0.1"));
        assert!(s.host_allowed("[::1]:8000"));
        assert!(!s.host_allowed("bank.green"));
    }

    #[test]
    fn test_wildcard_host() {
        let s = settings(&[("SECRET_KEY", "s"), ("ALLOWED_HOSTS", "*")]).unwrap();
        assert!(s.host_allowed("anything.test"));
    }

    #[test]
    fn test_dotenv_prefers_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bankgreen")).unwrap();
        std::fs::write(dir.path().join("bankgreen/.env"), "BANKGREEN_TEST_DOTENV_A=project\n").unwrap();
        std::fs::write(dir.path().join(".env"), "BANKGREEN_TEST_DOTENV_A=root\n").unwrap();

        let loaded = load_dotenv_from(dir.path()).unwrap();

        assert!(loaded.ends_with("bankgreen/.env"));
        assert_eq!(std::env::var("BANKGREEN_TEST_DOTENV_A").unwrap(), "project");
        assert!(load_dotenv_from(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_origin_allowed_is_anchored() {
        let s = settings(&[
            ("DEBUG", "True"),
            ("CORS_ALLOWED_ORIGIN_REGEXES", r"https://\w+\.bank\.green"),
        ])
        .unwrap();

        assert!(s.origin_allowed("https://app.bank.green"));
        assert!(!s.origin_allowed("https://app.bank.green.evil.com"));
        assert!(!s.origin_allowed("http://app.bank.green"));
    }
}
