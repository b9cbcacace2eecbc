//! The `kmsProviders` map and its validation rules.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bson::{Bson, Document};

use crate::error::{Error, Result};
use crate::options::{KEY_MATERIAL_LEN, provider_type};

/// Provider types whose credentials can be fetched from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AutoProvider {
    Aws,
    Azure,
    Gcp,
}

impl AutoProvider {
    pub fn name(self) -> &'static str {
        match self {
            AutoProvider::Aws => "aws",
            AutoProvider::Azure => "azure",
            AutoProvider::Gcp => "gcp",
        }
    }

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "aws" => Some(AutoProvider::Aws),
            "azure" => Some(AutoProvider::Azure),
            "gcp" => Some(AutoProvider::Gcp),
            _ => None,
        }
    }
}

/// Provider name → settings document.
///
/// A present-but-empty entry for `aws`, `azure` or `gcp` asks for credentials
/// to be fetched on demand. Static entries are passed to the engine as given.
#[derive(Clone, Default, PartialEq)]
pub struct KmsProviders {
    providers: BTreeMap<String, Document>,
}

impl KmsProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, settings: Document) -> Self {
        self.providers.insert(name.into(), settings);
        self
    }

    pub fn from_document(document: Document) -> Result<Self> {
        let mut providers = BTreeMap::new();
        for (name, settings) in document {
            match settings {
                Bson::Document(settings) => {
                    providers.insert(name, settings);
                }
                other => {
                    return Err(Error::configuration(format!(
                        "settings for KMS provider {name:?} must be a document, got {:?}",
                        other.element_type()
                    )));
                }
            }
        }
        Ok(Self { providers })
    }

    /// Parse a JSON object such as `{"local": {"key": "<base64>"}, "aws": {}}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("KMS providers are not valid JSON: {e}")))?;
        let document = bson::to_document(&value)
            .map_err(|e| Error::configuration(format!("KMS providers must be a JSON object: {e}")))?;
        Self::from_document(document)
    }

    pub fn get(&self, name: &str) -> Option<&Document> {
        self.providers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// True iff `name` is configured with an empty document.
    pub fn is_auto(&self, name: &str) -> bool {
        self.providers.get(name).is_some_and(Document::is_empty)
    }

    /// Providers configured for on-demand credentials.
    pub fn auto_providers(&self) -> Vec<AutoProvider> {
        self.providers
            .iter()
            .filter(|(_, settings)| settings.is_empty())
            .filter_map(|(name, _)| AutoProvider::from_name(name))
            .collect()
    }

    /// Fail unless `provider` is configured.
    pub fn ensure_configured(&self, provider: &str) -> Result<()> {
        if self.contains(provider) {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "KMS provider {provider:?} is not configured"
            )))
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::configuration(
                "at least one KMS provider must be configured",
            ));
        }
        for (name, settings) in &self.providers {
            validate_provider(name, settings)?;
        }
        Ok(())
    }

    /// Document handed to the engine; auto entries are left empty.
    pub fn to_document(&self) -> Document {
        self.providers
            .iter()
            .map(|(name, settings)| (name.clone(), Bson::Document(settings.clone())))
            .collect()
    }

    /// Same as [`KmsProviders::to_document`] with fetched credentials filled
    /// into the empty entries. Static entries are never replaced.
    pub fn with_credentials(&self, fetched: &BTreeMap<AutoProvider, Document>) -> Document {
        self.providers
            .iter()
            .map(|(name, settings)| {
                let settings = match AutoProvider::from_name(name) {
                    Some(auto) if settings.is_empty() => {
                        fetched.get(&auto).cloned().unwrap_or_default()
                    }
                    _ => settings.clone(),
                };
                (name.clone(), Bson::Document(settings))
            })
            .collect()
    }
}

impl fmt::Debug for KmsProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Settings hold secrets; only show which providers are configured.
        f.debug_map()
            .entries(self.providers.iter().map(|(name, settings)| {
                let shape = if settings.is_empty() { "auto" } else { "static" };
                (name, shape)
            }))
            .finish()
    }
}

fn validate_provider(name: &str, settings: &Document) -> Result<()> {
    let ty = provider_type(name);
    let named = ty.len() != name.len();
    if named && name[ty.len() + 1..].is_empty() {
        return Err(Error::configuration(format!(
            "KMS provider name {name:?} has an empty suffix"
        )));
    }
    if settings.is_empty() {
        if named {
            return Err(Error::configuration(format!(
                "named KMS provider {name:?} cannot fetch credentials automatically"
            )));
        }
        return match AutoProvider::from_name(ty) {
            Some(_) => Ok(()),
            None => Err(Error::configuration(format!(
                "KMS provider {name:?} requires settings"
            ))),
        };
    }

    let has = |field: &str| match settings.get(field) {
        Some(Bson::String(s)) => !s.is_empty(),
        Some(Bson::Binary(b)) => !b.bytes.is_empty(),
        Some(Bson::Null) | None => false,
        Some(_) => true,
    };
    let missing = |fields: &str| {
        Error::configuration(format!("KMS provider {name:?} requires {fields}"))
    };

    match ty {
        "aws" => {
            if !(has("accessKeyId") && has("secretAccessKey")) {
                return Err(missing("accessKeyId and secretAccessKey"));
            }
        }
        "azure" => {
            let client_credentials = has("tenantId") && has("clientId") && has("clientSecret");
            if !(has("accessToken") || client_credentials) {
                return Err(missing("accessToken, or tenantId, clientId and clientSecret"));
            }
        }
        "gcp" => {
            if !(has("accessToken") || (has("email") && has("privateKey"))) {
                return Err(missing("accessToken, or email and privateKey"));
            }
        }
        "local" => validate_local_key(name, settings.get("key"))?,
        "kmip" => {
            if !has("endpoint") {
                return Err(missing("endpoint"));
            }
        }
        _ => {
            return Err(Error::configuration(format!(
                "unknown KMS provider {name:?}"
            )));
        }
    }
    Ok(())
}

fn validate_local_key(name: &str, key: Option<&Bson>) -> Result<()> {
    let len = match key {
        Some(Bson::Binary(binary)) => binary.bytes.len(),
        Some(Bson::String(encoded)) => STANDARD
            .decode(encoded)
            .map_err(|e| {
                Error::configuration(format!("local key for {name:?} is not valid base64: {e}"))
            })?
            .len(),
        _ => {
            return Err(Error::configuration(format!(
                "KMS provider {name:?} requires a key"
            )));
        }
    };
    if len != KEY_MATERIAL_LEN {
        return Err(Error::configuration(format!(
            "local key for {name:?} must be {KEY_MATERIAL_LEN} bytes, got {len}"
        )));
    }
    Ok(())
}
