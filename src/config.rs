//! Configuration module for the CSP collector service.
//!
//! Settings are read once from environment variables at startup. Missing
//! required settings are fatal; everything else falls back to a default.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::forwarder::Transport;

/// Default directory for archive files
const DEFAULT_ARCHIVE_DIR: &str = ".";

/// Default number of reports buffered before a domain is flushed
const DEFAULT_MAX_REPORTS_PER_ARCHIVE: u64 = 1_000;

/// Default maximum accepted report body (64 KiB)
const DEFAULT_MAX_REPORT_SIZE: usize = 1 << 16;

/// Default deadline for one ingestion request, body included
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Upper bound for the ingestion request deadline
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Upper bound for the per-archive report count
const MAX_REPORTS_PER_ARCHIVE: u64 = 1_000_000;

/// Upper bound for the accepted report body (16 MiB)
const MAX_REPORT_SIZE: usize = 16 << 20;

const ENV_DOMAINS: &str = "CSP_COLLECTOR_DOMAINS";
const ENV_REPORT_ADDR: &str = "CSP_COLLECTOR_REPORT_ADDR";
const ENV_ADMIN_ADDR: &str = "CSP_COLLECTOR_ADMIN_ADDR";
const ENV_ARCHIVE_DIR: &str = "CSP_COLLECTOR_ARCHIVE_DIR";
const ENV_MAX_REPORTS: &str = "CSP_COLLECTOR_MAX_REPORTS_PER_ARCHIVE";
const ENV_MAX_REPORT_SIZE: &str = "CSP_COLLECTOR_MAX_REPORT_SIZE";
const ENV_REQUEST_TIMEOUT: &str = "CSP_COLLECTOR_REQUEST_TIMEOUT_SECS";
const ENV_SYSLOG_ADDR: &str = "CSP_COLLECTOR_SYSLOG_ADDR";
const ENV_SYSLOG_TRANSPORT: &str = "CSP_COLLECTOR_SYSLOG_TRANSPORT";
const ENV_POLICY_REPORT_URI: &str = "CSP_COLLECTOR_POLICY_REPORT_URI";

/// Configuration for the CSP collector service.
///
/// All settings can be configured via environment variables:
/// - `CSP_COLLECTOR_DOMAINS`: comma-separated whitelist (required)
/// - `CSP_COLLECTOR_REPORT_ADDR`: bind address for report ingestion (required)
/// - `CSP_COLLECTOR_ADMIN_ADDR`: bind address for the operator API (optional)
/// - `CSP_COLLECTOR_ARCHIVE_DIR`: where archives are written (default: `.`)
/// - `CSP_COLLECTOR_MAX_REPORTS_PER_ARCHIVE`: flush threshold (default: 1000)
/// - `CSP_COLLECTOR_MAX_REPORT_SIZE`: body limit in bytes (default: 65536)
/// - `CSP_COLLECTOR_REQUEST_TIMEOUT_SECS`: ingestion request deadline (default: 5)
/// - `CSP_COLLECTOR_SYSLOG_ADDR`: log collector address; unset disables forwarding
/// - `CSP_COLLECTOR_SYSLOG_TRANSPORT`: `tcp` or `udp` (default: tcp)
/// - `CSP_COLLECTOR_POLICY_REPORT_URI`: host advertised in the policy header
#[derive(Debug, Clone)]
pub struct Config {
    /// Whitelisted domains, in configuration order
    pub domains: Vec<String>,

    /// Address the report ingestion endpoint listens on
    pub report_addr: String,

    /// Address the operator API listens on, if enabled
    pub admin_addr: Option<String>,

    /// Directory holding archive files
    pub archive_dir: PathBuf,

    /// Number of buffered reports that forces a flush
    pub max_reports_per_archive: u64,

    /// Largest accepted report body in bytes
    pub max_report_size: usize,

    /// Deadline for reading and answering one ingestion request
    pub request_timeout: Duration,

    /// Remote log collector address; forwarding is disabled when unset
    pub syslog_addr: Option<String>,

    /// Transport used to reach the log collector
    pub syslog_transport: Transport,

    /// Host and port placed in the `report-uri` directive of rendered policies
    pub policy_report_uri: String,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error for {env_var}: required setting is missing")]
    Missing { env_var: &'static str },

    #[error("Configuration error for {env_var}: {message}")]
    Invalid {
        env_var: &'static str,
        message: String,
    },
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `CSP_COLLECTOR_DOMAINS` or `CSP_COLLECTOR_REPORT_ADDR` is missing
    /// - the domain list is empty or contains duplicates
    /// - a numeric setting is not a number or out of range
    /// - the syslog transport is unknown
    pub fn from_env() -> Result<Self, ConfigError> {
        let domains = Self::parse_domains()?;

        let report_addr = required(ENV_REPORT_ADDR)?;
        let admin_addr = optional(ENV_ADMIN_ADDR);

        let archive_dir = PathBuf::from(
            optional(ENV_ARCHIVE_DIR).unwrap_or_else(|| DEFAULT_ARCHIVE_DIR.to_string()),
        );

        let max_reports_per_archive = parse_bounded(
            ENV_MAX_REPORTS,
            DEFAULT_MAX_REPORTS_PER_ARCHIVE,
            1,
            MAX_REPORTS_PER_ARCHIVE,
        )?;
        let max_report_size =
            parse_bounded(ENV_MAX_REPORT_SIZE, DEFAULT_MAX_REPORT_SIZE, 1, MAX_REPORT_SIZE)?;

        let request_timeout = Duration::from_secs(parse_bounded(
            ENV_REQUEST_TIMEOUT,
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            MAX_REQUEST_TIMEOUT_SECS,
        )?);

        let syslog_addr = optional(ENV_SYSLOG_ADDR);
        let syslog_transport = match optional(ENV_SYSLOG_TRANSPORT) {
            Some(value) => value.parse().map_err(|message| ConfigError::Invalid {
                env_var: ENV_SYSLOG_TRANSPORT,
                message,
            })?,
            None => Transport::Tcp,
        };

        let policy_report_uri =
            optional(ENV_POLICY_REPORT_URI).unwrap_or_else(|| report_addr.clone());

        Ok(Self {
            domains,
            report_addr,
            admin_addr,
            archive_dir,
            max_reports_per_archive,
            max_report_size,
            request_timeout,
            syslog_addr,
            syslog_transport,
            policy_report_uri,
        })
    }

    /// Parse the domain whitelist, preserving order.
    fn parse_domains() -> Result<Vec<String>, ConfigError> {
        let raw = required(ENV_DOMAINS)?;
        let mut seen = HashSet::new();
        let mut domains = Vec::new();

        for name in raw.split(',').map(|d| d.trim().to_ascii_lowercase()) {
            if name.is_empty() {
                continue;
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid {
                    env_var: ENV_DOMAINS,
                    message: format!("domain '{}' is listed more than once", name),
                });
            }
            domains.push(name);
        }

        if domains.is_empty() {
            return Err(ConfigError::Invalid {
                env_var: ENV_DOMAINS,
                message: "needs at least one whitelisted domain".to_string(),
            });
        }

        Ok(domains)
    }
}

impl Default for Config {
    /// A single-domain configuration writing to the current directory.
    ///
    /// Useful for tests; production always goes through `from_env`.
    fn default() -> Self {
        Self {
            domains: vec!["example.com".to_string()],
            report_addr: "127.0.0.1:8080".to_string(),
            admin_addr: None,
            archive_dir: PathBuf::from(DEFAULT_ARCHIVE_DIR),
            max_reports_per_archive: DEFAULT_MAX_REPORTS_PER_ARCHIVE,
            max_report_size: DEFAULT_MAX_REPORT_SIZE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            syslog_addr: None,
            syslog_transport: Transport::Tcp,
            policy_report_uri: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Read a variable, treating empty values as unset.
fn optional(env_var: &str) -> Option<String> {
    env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(env_var: &'static str) -> Result<String, ConfigError> {
    optional(env_var).ok_or(ConfigError::Missing { env_var })
}

/// Parse a numeric variable and check it against inclusive bounds.
fn parse_bounded<T>(env_var: &'static str, default: T, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Some(value) = optional(env_var) else {
        return Ok(default);
    };

    let parsed: T = value.parse().map_err(|_| ConfigError::Invalid {
        env_var,
        message: format!("'{}' is not a valid number", value),
    })?;

    if parsed < min {
        return Err(ConfigError::Invalid {
            env_var,
            message: format!("{} is below minimum ({})", parsed, min),
        });
    }

    if parsed > max {
        return Err(ConfigError::Invalid {
            env_var,
            message: format!("{} exceeds maximum ({})", parsed, max),
        });
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // Environment is process-wide; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn clear_optional() -> Vec<EnvGuard> {
        [
            ENV_ADMIN_ADDR,
            ENV_ARCHIVE_DIR,
            ENV_MAX_REPORTS,
            ENV_MAX_REPORT_SIZE,
            ENV_REQUEST_TIMEOUT,
            ENV_SYSLOG_ADDR,
            ENV_SYSLOG_TRANSPORT,
            ENV_POLICY_REPORT_URI,
        ]
        .iter()
        .map(|k| EnvGuard::remove(k))
        .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.domains, vec!["example.com"]);
        assert_eq!(config.max_reports_per_archive, 1_000);
        assert_eq!(config.max_report_size, 65_536);
        assert_eq!(config.syslog_transport, Transport::Tcp);
        assert!(config.syslog_addr.is_none());
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.domains, vec!["example.com"]);
        assert_eq!(config.report_addr, "0.0.0.0:8443");
        assert_eq!(config.archive_dir, PathBuf::from("."));
        assert_eq!(config.max_reports_per_archive, 1_000);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.policy_report_uri, "0.0.0.0:8443");
        assert!(config.admin_addr.is_none());
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, " Example.com, shop.example.org ,, ");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _a = EnvGuard::set(ENV_ADMIN_ADDR, "127.0.0.1:9000");
        let _z = EnvGuard::set(ENV_ARCHIVE_DIR, "/var/lib/csp");
        let _m = EnvGuard::set(ENV_MAX_REPORTS, "50");
        let _w = EnvGuard::set(ENV_REQUEST_TIMEOUT, "12");
        let _s = EnvGuard::set(ENV_SYSLOG_ADDR, "logs.internal:514");
        let _t = EnvGuard::set(ENV_SYSLOG_TRANSPORT, "UDP");
        let _p = EnvGuard::set(ENV_POLICY_REPORT_URI, "csp.example.com");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.domains, vec!["example.com", "shop.example.org"]);
        assert_eq!(config.admin_addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.archive_dir, PathBuf::from("/var/lib/csp"));
        assert_eq!(config.max_reports_per_archive, 50);
        assert_eq!(config.request_timeout, Duration::from_secs(12));
        assert_eq!(config.syslog_addr.as_deref(), Some("logs.internal:514"));
        assert_eq!(config.syslog_transport, Transport::Udp);
        assert_eq!(config.policy_report_uri, "csp.example.com");
    }

    #[test]
    fn test_missing_domains() {
        let _lock = env_lock();
        let _d = EnvGuard::remove(ENV_DOMAINS);
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { env_var } if env_var == ENV_DOMAINS));
    }

    #[test]
    fn test_missing_report_addr() {
        let _lock = env_lock();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::remove(ENV_REPORT_ADDR);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { env_var } if env_var == ENV_REPORT_ADDR));
    }

    #[test]
    fn test_empty_domain_list() {
        let _lock = env_lock();
        let _d = EnvGuard::set(ENV_DOMAINS, " , ,");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn test_duplicate_domain() {
        let _lock = env_lock();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com,EXAMPLE.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_invalid_max_reports() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _m = EnvGuard::set(ENV_MAX_REPORTS, "lots");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("not a valid number"));
    }

    #[test]
    fn test_zero_max_reports() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _m = EnvGuard::set(ENV_MAX_REPORTS, "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("below minimum"));
    }

    #[test]
    fn test_report_size_exceeds_max() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _s = EnvGuard::set(ENV_MAX_REPORT_SIZE, "999999999");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_zero_request_timeout() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _w = EnvGuard::set(ENV_REQUEST_TIMEOUT, "0");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains(ENV_REQUEST_TIMEOUT));
    }

    #[test]
    fn test_unknown_transport() {
        let _lock = env_lock();
        let _optional = clear_optional();
        let _d = EnvGuard::set(ENV_DOMAINS, "example.com");
        let _r = EnvGuard::set(ENV_REPORT_ADDR, "0.0.0.0:8443");
        let _t = EnvGuard::set(ENV_SYSLOG_TRANSPORT, "carrier-pigeon");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains(ENV_SYSLOG_TRANSPORT));
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid {
            env_var: "TEST_VAR",
            message: "test error".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let missing = ConfigError::Missing { env_var: "TEST_VAR" };
        assert_eq!(
            format!("{}", missing),
            "Configuration error for TEST_VAR: required setting is missing"
        );
    }
}
