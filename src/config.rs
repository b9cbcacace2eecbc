use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::app_dir::app_user_data_file_path;
use crate::credentials::KmsProviders;
use crate::helper::{DEFAULT_HELPER_URI, HelperOptions};
use crate::options::{AutoEncryptionOptions, EncryptionOptions, KeyCacheExpiry, Namespace};
use crate::state_machine::kms::DEFAULT_PROXY_PORT;
use crate::state_machine::{KmsTlsOptions, ProxyOptions};

/// Prefix of every environment variable read by [`Config::load`].
pub const ENV_PREFIX: &str = "FIELD_CRYPT_";

/// Settings read from the environment and `.env` files.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// `db.collection` holding the data keys
    pub key_vault_namespace: String,
    /// JSON object of provider settings, e.g. `{"aws": {}}`
    pub kms_providers: Option<String>,
    /// JSON object of per-provider TLS settings
    pub kms_tls_options: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    #[serde(default = "default_helper_uri")]
    pub helper_uri: String,
    pub helper_spawn_path: Option<PathBuf>,
    /// Whitespace separated
    pub helper_spawn_args: Option<String>,
    #[serde(default)]
    pub helper_bypass_spawn: bool,
    /// e.g. `10s`
    pub helper_spawn_timeout: Option<String>,
    #[serde(default)]
    pub bypass_auto_encryption: bool,
    #[serde(default)]
    pub bypass_query_analysis: bool,
    /// `0` keeps data keys cached forever
    pub key_expiration_ms: Option<u64>,
    /// e.g. `5s`
    pub credential_timeout: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    LoadError(String),
    #[error(transparent)]
    Invalid(#[from] crate::Error),
}

fn default_helper_uri() -> String {
    DEFAULT_HELPER_URI.to_owned()
}

impl Config {
    /// Load from the process environment, after applying the `.env` file in
    /// the application directory and one in the working directory.
    /// Variables already set in the environment win.
    pub fn load() -> Result<Self, ConfigError> {
        match app_user_data_file_path(".env") {
            Ok(path) => match dotenvy::from_path(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "loaded .env file"),
                Err(err) => tracing::debug!(?err, path = %path.display(), "no usable .env file"),
            },
            Err(err) => tracing::warn!(?err, "unable to locate the application directory"),
        }
        if let Ok(path) = dotenvy::dotenv() {
            tracing::info!(path = %path.display(), "loaded .env file");
        }

        envy::prefixed(ENV_PREFIX)
            .from_env::<Config>()
            .inspect_err(|err| tracing::error!(?err, "failed to load configuration"))
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    /// Load from explicit `(name, value)` pairs, names including the prefix.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| ConfigError::LoadError(e.to_string()))
    }

    pub fn proxy(&self) -> Result<Option<ProxyOptions>, ConfigError> {
        let Some(host) = &self.proxy_host else {
            if self.proxy_port.is_some()
                || self.proxy_username.is_some()
                || self.proxy_password.is_some()
            {
                return Err(ConfigError::LoadError(format!(
                    "{ENV_PREFIX}PROXY_HOST is required when other proxy settings are given"
                )));
            }
            return Ok(None);
        };
        Ok(Some(ProxyOptions {
            host: host.clone(),
            port: self.proxy_port.unwrap_or(DEFAULT_PROXY_PORT),
            username: self.proxy_username.clone(),
            password: self.proxy_password.clone(),
        }))
    }

    pub fn encryption_options(&self) -> Result<EncryptionOptions, ConfigError> {
        let namespace: Namespace = self.key_vault_namespace.parse()?;
        let providers = match &self.kms_providers {
            Some(json) => KmsProviders::from_json(json)?,
            None => KmsProviders::new(),
        };
        let mut options = EncryptionOptions::new(namespace, providers);
        if let Some(json) = &self.kms_tls_options {
            options.tls_options = KmsTlsOptions::from_json(json)?;
        }
        options.proxy = self.proxy()?;
        options.key_expiration = KeyCacheExpiry::from_millis(self.key_expiration_ms);
        if let Some(timeout) = &self.credential_timeout {
            options.credential_timeout = parse_duration("CREDENTIAL_TIMEOUT", timeout)?;
        }
        options.validate()?;
        Ok(options)
    }

    pub fn helper_options(&self) -> Result<HelperOptions, ConfigError> {
        let mut helper = HelperOptions {
            uri: self.helper_uri.clone(),
            spawn_path: self.helper_spawn_path.clone(),
            spawn_args: self
                .helper_spawn_args
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
            bypass_spawn: self.helper_bypass_spawn,
            ..Default::default()
        };
        if let Some(timeout) = &self.helper_spawn_timeout {
            helper.spawn_timeout = parse_duration("HELPER_SPAWN_TIMEOUT", timeout)?;
        }
        helper.validate()?;
        Ok(helper)
    }

    pub fn auto_encryption_options(&self) -> Result<AutoEncryptionOptions, ConfigError> {
        Ok(AutoEncryptionOptions {
            encryption: self.encryption_options()?,
            helper: self.helper_options()?,
            bypass_auto_encryption: self.bypass_auto_encryption,
            bypass_query_analysis: self.bypass_query_analysis,
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("key_vault_namespace", &self.key_vault_namespace)
            .field("kms_providers", &self.kms_providers.as_ref().map(|_| "***"))
            .field("kms_tls_options", &self.kms_tls_options)
            .field("proxy_host", &self.proxy_host)
            .field("proxy_port", &self.proxy_port)
            .field("proxy_username", &self.proxy_username)
            .field("proxy_password", &self.proxy_password.as_ref().map(|_| "***"))
            .field("helper_uri", &self.helper_uri)
            .field("helper_spawn_path", &self.helper_spawn_path)
            .field("helper_spawn_args", &self.helper_spawn_args)
            .field("helper_bypass_spawn", &self.helper_bypass_spawn)
            .field("helper_spawn_timeout", &self.helper_spawn_timeout)
            .field("bypass_auto_encryption", &self.bypass_auto_encryption)
            .field("bypass_query_analysis", &self.bypass_query_analysis)
            .field("key_expiration_ms", &self.key_expiration_ms)
            .field("credential_timeout", &self.credential_timeout)
            .finish()
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::LoadError(format!("{ENV_PREFIX}{name}={value:?}: {e}")))
}
