//! Configuration: resolves the ACME endpoint, domain list, and the opaque filesystem
//! paths every other component treats as handles (account record, account identity,
//! certificate, certificate identity).

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ValueEnum;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::fs_util::cert_dir_name;

/// Which ACME endpoint to provision against.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    Production,
    Staging,
    /// A local test CA (e.g. Pebble) reachable at `https://localhost:14000/dir`.
    Test,
}

impl ServerType {
    #[must_use]
    pub fn directory_url(self) -> &'static str {
        match self {
            Self::Production => "https://acme-v02.api.letsencrypt.org/directory",
            Self::Staging => "https://acme-staging-v02.api.letsencrypt.org/directory",
            Self::Test => "https://localhost:14000/dir",
        }
    }

    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeSettings {
    pub http_challenge_port: u16,
    pub directory_fetch_attempts: u64,
    pub directory_fetch_base_delay_secs: u64,
    pub directory_fetch_max_delay_secs: u64,
    pub poll_attempts: u64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySettings {
    pub backoff_secs: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonSettings {
    pub check_interval: String,
    pub renew_before: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub email: Option<String>,
    pub domains: Vec<String>,
    pub server: ServerType,
    pub root: PathBuf,
    pub daemon: DaemonSettings,
    pub acme: AcmeSettings,
    pub retry: RetrySettings,
}

const DEFAULT_SERVER: &str = "test";
const DEFAULT_ROOT: &str = "./acme-autotls-data";
const DEFAULT_CHECK_INTERVAL: &str = "24h";
const DEFAULT_RENEW_BEFORE: &str = "720h";
const DEFAULT_HTTP_CHALLENGE_PORT: u16 = 80;
const DEFAULT_DIRECTORY_FETCH_ATTEMPTS: u64 = 10;
const DEFAULT_DIRECTORY_FETCH_BASE_DELAY_SECS: u64 = 1;
const DEFAULT_DIRECTORY_FETCH_MAX_DELAY_SECS: u64 = 10;
const DEFAULT_POLL_ATTEMPTS: u64 = 15;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_RETRY_BACKOFF_SECS: [u64; 4] = [5, 10, 30, 60];

impl Settings {
    /// Loads layered configuration: built-in defaults, an optional TOML file, then
    /// `ACMETLS_`-prefixed environment variables, in that order of increasing priority.
    ///
    /// # Errors
    /// Returns an error if the config file is malformed or a value fails to deserialize.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server", DEFAULT_SERVER)?
            .set_default("root", DEFAULT_ROOT)?
            .set_default("domains", Vec::<String>::new())?
            .set_default("daemon.check_interval", DEFAULT_CHECK_INTERVAL)?
            .set_default("daemon.renew_before", DEFAULT_RENEW_BEFORE)?
            .set_default("acme.http_challenge_port", DEFAULT_HTTP_CHALLENGE_PORT)?
            .set_default(
                "acme.directory_fetch_attempts",
                DEFAULT_DIRECTORY_FETCH_ATTEMPTS,
            )?
            .set_default(
                "acme.directory_fetch_base_delay_secs",
                DEFAULT_DIRECTORY_FETCH_BASE_DELAY_SECS,
            )?
            .set_default(
                "acme.directory_fetch_max_delay_secs",
                DEFAULT_DIRECTORY_FETCH_MAX_DELAY_SECS,
            )?
            .set_default("acme.poll_attempts", DEFAULT_POLL_ATTEMPTS)?
            .set_default("acme.poll_interval_secs", DEFAULT_POLL_INTERVAL_SECS)?
            .set_default("retry.backoff_secs", DEFAULT_RETRY_BACKOFF_SECS.to_vec())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from("autotls.toml"));
        builder = builder.add_source(File::from(path).required(false));
        builder = builder.add_source(Environment::with_prefix("ACMETLS").separator("_"));

        builder.build()?.try_deserialize()
    }

    /// Merges CLI overrides on top of whatever was loaded from file/env.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(server) = args.server {
            self.server = server;
        }
        if !args.domains.is_empty() {
            self.domains.clone_from(&args.domains);
        }
        if let Some(email) = &args.email {
            self.email = Some(email.clone());
        }
        if let Some(root) = &args.root {
            self.root.clone_from(root);
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns an error if the domain list is empty or any numeric setting is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.domains.is_empty() || self.domains.iter().any(|d| d.trim().is_empty()) {
            anyhow::bail!("DomainsArrayIsNotAnArrayOfStrings: domains must be a non-empty list of hostnames");
        }
        if self.acme.directory_fetch_attempts == 0 {
            anyhow::bail!("acme.directory_fetch_attempts must be greater than 0");
        }
        if self.acme.poll_attempts == 0 {
            anyhow::bail!("acme.poll_attempts must be greater than 0");
        }
        if self.acme.poll_interval_secs == 0 {
            anyhow::bail!("acme.poll_interval_secs must be greater than 0");
        }
        if self.acme.directory_fetch_base_delay_secs == 0 {
            anyhow::bail!("acme.directory_fetch_base_delay_secs must be greater than 0");
        }
        if self.acme.directory_fetch_max_delay_secs == 0 {
            anyhow::bail!("acme.directory_fetch_max_delay_secs must be greater than 0");
        }
        if self.acme.directory_fetch_base_delay_secs > self.acme.directory_fetch_max_delay_secs {
            anyhow::bail!(
                "acme.directory_fetch_base_delay_secs must be <= acme.directory_fetch_max_delay_secs"
            );
        }
        if self.retry.backoff_secs.is_empty() || self.retry.backoff_secs.contains(&0) {
            anyhow::bail!("retry.backoff_secs must be a non-empty list of positive values");
        }
        Ok(())
    }

    /// Parsed renewal-check interval.
    ///
    /// # Errors
    /// Returns an error if the configured string isn't a valid `humantime` duration.
    pub fn check_interval(&self) -> Result<std::time::Duration> {
        Ok(humantime::parse_duration(&self.daemon.check_interval)?)
    }

    /// Parsed renewal lead time (how long before `notAfter` to reprovision).
    ///
    /// # Errors
    /// Returns an error if the configured string isn't a valid `humantime` duration.
    pub fn renew_before(&self) -> Result<std::time::Duration> {
        Ok(humantime::parse_duration(&self.daemon.renew_before)?)
    }

    /// `<root>/{server_dir_name}` — the per-environment directory everything else nests
    /// under, per spec.md §6's filesystem layout.
    #[must_use]
    pub fn server_dir(&self) -> PathBuf {
        self.root.join(self.server.dir_name())
    }

    #[must_use]
    pub fn account_record_path(&self) -> PathBuf {
        self.server_dir().join("account.json")
    }

    #[must_use]
    pub fn account_identity_path(&self) -> PathBuf {
        self.server_dir().join("account-identity.pem")
    }

    /// `<root>/{server}/<certDirName>` — the directory for this process's single
    /// domain-set certificate.
    #[must_use]
    pub fn cert_dir(&self) -> PathBuf {
        self.server_dir().join(cert_dir_name(&self.domains))
    }

    #[must_use]
    pub fn certificate_path(&self) -> PathBuf {
        self.cert_dir().join("certificate.pem")
    }

    #[must_use]
    pub fn certificate_identity_path(&self) -> PathBuf {
        self.cert_dir().join("certificate-identity.pem")
    }
}

#[must_use]
pub fn default_config_path(candidate: &Path) -> PathBuf {
    candidate.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.server, ServerType::Test);
        assert_eq!(settings.daemon.check_interval, "24h");
        assert_eq!(settings.daemon.renew_before, "720h");
        assert_eq!(settings.acme.http_challenge_port, 80);
        assert_eq!(settings.acme.poll_attempts, 15);
        assert_eq!(settings.retry.backoff_secs, vec![5, 10, 30, 60]);
    }

    #[test]
    fn test_validate_rejects_empty_domains() {
        let mut settings = Settings::load(None).unwrap();
        settings.domains = Vec::new();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("DomainsArrayIsNotAnArrayOfStrings"));
    }

    #[test]
    fn test_validate_rejects_blank_domain_entries() {
        let mut settings = Settings::load(None).unwrap();
        settings.domains = vec![String::new()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_acme_settings() {
        let mut settings = Settings::load(None).unwrap();
        settings.domains = vec!["example.com".to_string()];
        settings.acme.directory_fetch_attempts = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("directory_fetch_attempts"));
    }

    #[test]
    fn test_paths_nest_under_server_type_dir_name() {
        let mut settings = Settings::load(None).unwrap();
        settings.root = PathBuf::from("/tmp/ae");
        settings.domains = vec!["a.test".to_string()];
        settings.server = ServerType::Staging;

        assert_eq!(settings.server_dir(), PathBuf::from("/tmp/ae/staging"));
        assert_eq!(
            settings.account_record_path(),
            PathBuf::from("/tmp/ae/staging/account.json")
        );
        assert_eq!(
            settings.cert_dir(),
            PathBuf::from("/tmp/ae/staging/a.test")
        );
    }
}
