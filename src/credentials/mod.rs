//! On-demand KMS credentials for providers configured with an empty entry.

pub mod aws;
pub mod azure;
pub mod cache;
pub mod gcp;
pub mod providers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use futures::future::try_join_all;
use serde::Deserialize;
use tokio::time::Instant;
use zeroize::Zeroizing;

pub use cache::{CachedToken, Credential, CredentialCache, Expiry, REFRESH_MARGIN, TokenSource};
pub use providers::{AutoProvider, KmsProviders};

use crate::error::{CredentialError, Error, Result};

/// Resolves credentials for every auto-configured provider, one cache each.
pub struct KmsCredentials {
    providers: KmsProviders,
    caches: Vec<(AutoProvider, CredentialCache)>,
}

impl KmsCredentials {
    /// Build the default provider sources. Each endpoint request is bounded
    /// by `request_timeout`.
    pub fn new(providers: KmsProviders, request_timeout: Duration) -> Result<Self> {
        let auto = providers.auto_providers();
        if auto.is_empty() {
            return Ok(Self::with_sources(providers, Vec::new()));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("unable to build HTTP client: {e}")))?;

        let mut sources: Vec<Arc<dyn TokenSource>> = Vec::with_capacity(auto.len());
        for provider in auto {
            let source: Arc<dyn TokenSource> = match provider {
                AutoProvider::Aws => Arc::new(aws::AwsCredentialSource::new(client.clone())),
                AutoProvider::Azure => Arc::new(azure::AzureTokenSource::new(client.clone())),
                AutoProvider::Gcp => Arc::new(
                    gcp::GcpTokenSource::new(client.clone()).map_err(|source| {
                        Error::Credential {
                            provider: provider.name().to_owned(),
                            source,
                        }
                    })?,
                ),
            };
            sources.push(source);
        }
        Ok(Self::with_sources(providers, sources))
    }

    /// Use the given sources. Sources for providers that are not configured
    /// for automatic retrieval are ignored.
    pub fn with_sources(providers: KmsProviders, sources: Vec<Arc<dyn TokenSource>>) -> Self {
        let caches = sources
            .into_iter()
            .filter_map(|source| {
                let provider = AutoProvider::from_name(source.provider())?;
                providers
                    .is_auto(provider.name())
                    .then(|| (provider, CredentialCache::new(source)))
            })
            .collect();
        Self { providers, caches }
    }

    pub fn providers(&self) -> &KmsProviders {
        &self.providers
    }

    pub fn has_auto_providers(&self) -> bool {
        !self.caches.is_empty()
    }

    /// The full providers document with fetched credentials filled in.
    /// Cached credentials are reused until they are about to expire.
    pub async fn refresh(&self) -> Result<Document> {
        let fetched = try_join_all(self.caches.iter().map(|(provider, cache)| async move {
            let token = cache.get_token().await.map_err(|source| Error::Credential {
                provider: provider.name().to_owned(),
                source,
            })?;
            Ok::<_, Error>((*provider, token.credential.to_document()))
        }))
        .await?;
        let fetched: BTreeMap<_, _> = fetched.into_iter().collect();
        Ok(self.providers.with_credentials(&fetched))
    }

    /// Forget every cached credential.
    pub fn reset(&self) {
        for (_, cache) in &self.caches {
            cache.reset_cache();
        }
    }
}

impl std::fmt::Debug for KmsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsCredentials")
            .field("providers", &self.providers)
            .field(
                "auto",
                &self.caches.iter().map(|(p, _)| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Whether a bearer token response must state its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenLifetime {
    Required,
    /// Tokens without `expires_in` are used once and not cached.
    Optional,
}

pub(crate) async fn get_text(
    request: reqwest::RequestBuilder,
    endpoint: &str,
) -> std::result::Result<(u16, String), CredentialError> {
    let request_error = |e: reqwest::Error| CredentialError::Request {
        endpoint: endpoint.to_owned(),
        message: e.to_string(),
    };
    let response = request.send().await.map_err(request_error)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(request_error)?;
    Ok((status, body))
}

#[derive(Deserialize)]
struct BearerTokenResponse {
    access_token: Option<String>,
    expires_in: Option<serde_json::Value>,
}

/// Parse an OAuth token response from a metadata endpoint.
pub(crate) fn parse_bearer_token(
    endpoint: &str,
    status: u16,
    body: &str,
    lifetime: TokenLifetime,
) -> std::result::Result<CachedToken, CredentialError> {
    if status != 200 {
        return Err(CredentialError::Endpoint {
            endpoint: endpoint.to_owned(),
            status,
            body: body.to_owned(),
        });
    }
    let response: BearerTokenResponse = serde_json::from_str(body)
        .map_err(|e| CredentialError::Malformed(format!("{endpoint}: {e}")))?;
    let access_token = response
        .access_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| CredentialError::Malformed(format!("{endpoint}: missing access_token")))?;
    let credential = Credential::AccessToken(Zeroizing::new(access_token));

    match (response.expires_in, lifetime) {
        (Some(expires_in), _) => {
            let seconds = parse_seconds(&expires_in)?;
            Ok(CachedToken::expiring_in(credential, Duration::from_secs(seconds)))
        }
        (None, TokenLifetime::Optional) => {
            Ok(CachedToken::new(credential, Expiry::At(Instant::now())))
        }
        (None, TokenLifetime::Required) => Err(CredentialError::Malformed(format!(
            "{endpoint}: missing expires_in"
        ))),
    }
}

fn parse_seconds(value: &serde_json::Value) -> std::result::Result<u64, CredentialError> {
    let seconds = match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    seconds.ok_or_else(|| {
        CredentialError::Malformed(format!("expires_in {value} is not a number of seconds"))
    })
}
