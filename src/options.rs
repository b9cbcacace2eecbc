//! Typed options for the encryption sessions.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bson::{Binary, Bson, Document, spec::BinarySubtype};
use serde::Serialize;

use crate::credentials::providers::KmsProviders;
use crate::error::{Error, Result};
use crate::helper::HelperOptions;
use crate::state_machine::tls::KmsTlsOptions;
use crate::state_machine::ProxyOptions;

/// Length of a local master key and of caller-supplied key material.
pub const KEY_MATERIAL_LEN: usize = 96;

/// Default lifetime of data keys cached by the engine.
pub const DEFAULT_KEY_EXPIRATION: Duration = Duration::from_secs(60);

/// `db.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::configuration(format!(
                "namespace {s:?} must have the form <db>.<collection>"
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Lifetime of data keys in the engine's key cache.
///
/// `0` in configuration means keys never expire, which is distinct from
/// "not configured".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyCacheExpiry {
    #[default]
    Default,
    After(Duration),
    Never,
}

impl KeyCacheExpiry {
    pub fn from_millis(millis: Option<u64>) -> Self {
        match millis {
            None => KeyCacheExpiry::Default,
            Some(0) => KeyCacheExpiry::Never,
            Some(ms) => KeyCacheExpiry::After(Duration::from_millis(ms)),
        }
    }

    /// `None` when keys never expire.
    pub fn duration(self) -> Option<Duration> {
        match self {
            KeyCacheExpiry::Default => Some(DEFAULT_KEY_EXPIRATION),
            KeyCacheExpiry::After(d) => Some(d),
            KeyCacheExpiry::Never => None,
        }
    }
}

/// Options shared by the auto and explicit sessions.
#[derive(Debug, Clone)]
pub struct EncryptionOptions {
    pub key_vault_namespace: Namespace,
    pub kms_providers: KmsProviders,
    pub tls_options: KmsTlsOptions,
    pub proxy: Option<ProxyOptions>,
    pub key_expiration: KeyCacheExpiry,
    /// Upper bound for a single credential endpoint request.
    pub credential_timeout: Duration,
}

impl EncryptionOptions {
    pub fn new(key_vault_namespace: Namespace, kms_providers: KmsProviders) -> Self {
        Self {
            key_vault_namespace,
            kms_providers,
            tls_options: KmsTlsOptions::default(),
            proxy: None,
            key_expiration: KeyCacheExpiry::Default,
            credential_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.kms_providers.validate()?;
        self.tls_options.validate()?;
        if let Some(proxy) = &self.proxy {
            proxy.validate()?;
        }
        Ok(())
    }
}

/// Options for [`crate::session::AutoEncrypter`].
#[derive(Debug, Clone)]
pub struct AutoEncryptionOptions {
    pub encryption: EncryptionOptions,
    pub helper: HelperOptions,
    /// Skip encryption of outgoing commands; replies are still decrypted.
    pub bypass_auto_encryption: bool,
    /// Skip command analysis, and with it the marking helper.
    pub bypass_query_analysis: bool,
}

impl AutoEncryptionOptions {
    pub fn new(encryption: EncryptionOptions) -> Self {
        Self {
            encryption,
            helper: HelperOptions::default(),
            bypass_auto_encryption: false,
            bypass_query_analysis: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.encryption.validate()?;
        self.helper.validate()
    }
}

/// Provider-specific description of the key that wraps a data key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MasterKey {
    #[serde(rename_all = "camelCase")]
    Aws {
        region: String,
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Azure {
        key_vault_endpoint: String,
        key_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_version: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Gcp {
        project_id: String,
        location: String,
        key_ring: String,
        key_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        key_version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Kmip {
        #[serde(skip_serializing_if = "Option::is_none")]
        key_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        delegated: Option<bool>,
    },
}

impl MasterKey {
    /// Provider type this master key belongs to.
    pub fn provider_type(&self) -> &'static str {
        match self {
            MasterKey::Aws { .. } => "aws",
            MasterKey::Azure { .. } => "azure",
            MasterKey::Gcp { .. } => "gcp",
            MasterKey::Kmip { .. } => "kmip",
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        bson::to_document(self).map_err(Error::bson)
    }
}

/// Provider type of a possibly named provider (`aws:prod` → `aws`).
pub fn provider_type(provider: &str) -> &str {
    provider.split_once(':').map_or(provider, |(ty, _)| ty)
}

/// Options for creating a data key.
#[derive(Debug, Clone, Default)]
pub struct DataKeyOptions {
    pub master_key: Option<MasterKey>,
    pub key_alt_names: Vec<String>,
    /// Caller-supplied key material; generated by the engine when absent.
    pub key_material: Option<Vec<u8>>,
}

impl DataKeyOptions {
    pub fn validate(&self, provider: &str) -> Result<()> {
        let ty = provider_type(provider);
        match (&self.master_key, ty) {
            (Some(_), "local") => {
                return Err(Error::configuration(
                    "a master key must not be given for the local KMS provider",
                ));
            }
            (None, "local" | "kmip") => {}
            (None, _) => {
                return Err(Error::configuration(format!(
                    "a master key is required for KMS provider {provider:?}"
                )));
            }
            (Some(key), _) if key.provider_type() != ty => {
                return Err(Error::configuration(format!(
                    "{} master key given for KMS provider {provider:?}",
                    key.provider_type()
                )));
            }
            _ => {}
        }
        if let Some(material) = &self.key_material
            && material.len() != KEY_MATERIAL_LEN
        {
            return Err(Error::configuration(format!(
                "key material must be {KEY_MATERIAL_LEN} bytes, got {}",
                material.len()
            )));
        }
        if self.key_alt_names.iter().any(String::is_empty) {
            return Err(Error::configuration("key alt names must not be empty"));
        }
        Ok(())
    }
}

/// Options for rewrapping data keys.
#[derive(Debug, Clone, Default)]
pub struct RewrapManyDataKeyOptions {
    pub provider: Option<String>,
    pub master_key: Option<MasterKey>,
}

impl RewrapManyDataKeyOptions {
    pub fn validate(&self) -> Result<()> {
        match (&self.provider, &self.master_key) {
            (None, Some(_)) => Err(Error::configuration(
                "a master key may only be given together with a provider",
            )),
            (Some(provider), Some(key)) if key.provider_type() != provider_type(provider) => {
                Err(Error::configuration(format!(
                    "{} master key given for KMS provider {provider:?}",
                    key.provider_type()
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Deterministic,
    Random,
    Indexed,
    Unindexed,
    Range,
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Deterministic => "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic",
            Algorithm::Random => "AEAD_AES_256_CBC_HMAC_SHA_512-Random",
            Algorithm::Indexed => "Indexed",
            Algorithm::Unindexed => "Unindexed",
            Algorithm::Range => "Range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Equality,
    Range,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryType::Equality => "equality",
            QueryType::Range => "range",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeOptions {
    pub min: Option<Bson>,
    pub max: Option<Bson>,
    pub sparsity: Option<i64>,
    pub trim_factor: Option<i32>,
    pub precision: Option<i32>,
}

/// Options for explicit encryption.
#[derive(Debug, Clone)]
pub struct EncryptOptions {
    pub key_id: Option<Binary>,
    pub key_alt_name: Option<String>,
    pub algorithm: Algorithm,
    pub contention_factor: Option<i64>,
    pub query_type: Option<QueryType>,
    pub range_options: Option<RangeOptions>,
}

impl EncryptOptions {
    pub fn with_key_id(key_id: Binary, algorithm: Algorithm) -> Self {
        Self {
            key_id: Some(key_id),
            key_alt_name: None,
            algorithm,
            contention_factor: None,
            query_type: None,
            range_options: None,
        }
    }

    pub fn with_key_alt_name(key_alt_name: impl Into<String>, algorithm: Algorithm) -> Self {
        Self {
            key_id: None,
            key_alt_name: Some(key_alt_name.into()),
            algorithm,
            contention_factor: None,
            query_type: None,
            range_options: None,
        }
    }

    pub fn validate(&self, expression: bool) -> Result<()> {
        match (&self.key_id, &self.key_alt_name) {
            (Some(_), Some(_)) => {
                return Err(Error::configuration(
                    "key id and key alt name are mutually exclusive",
                ));
            }
            (None, None) => {
                return Err(Error::configuration(
                    "either a key id or a key alt name is required",
                ));
            }
            (Some(id), None) if id.subtype != BinarySubtype::Uuid => {
                return Err(Error::configuration("key id must be a UUID binary"));
            }
            _ => {}
        }
        if self.range_options.is_some() && self.algorithm != Algorithm::Range {
            return Err(Error::configuration(
                "range options require the Range algorithm",
            ));
        }
        if self.query_type == Some(QueryType::Range) && self.algorithm != Algorithm::Range {
            return Err(Error::configuration(
                "the range query type requires the Range algorithm",
            ));
        }
        if expression && self.algorithm != Algorithm::Range {
            return Err(Error::configuration(
                "expressions can only be encrypted with the Range algorithm",
            ));
        }
        if self.contention_factor.is_some()
            && !matches!(self.algorithm, Algorithm::Indexed | Algorithm::Range)
        {
            return Err(Error::configuration(
                "a contention factor requires the Indexed or Range algorithm",
            ));
        }
        Ok(())
    }
}
