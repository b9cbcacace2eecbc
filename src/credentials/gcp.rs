use async_trait::async_trait;
use url::Url;

use super::cache::{CachedToken, TokenSource};
use super::{TokenLifetime, get_text, parse_bearer_token};
use crate::error::CredentialError;

/// Overrides the metadata server host, as on GCE.
pub const GCE_METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Fetches an access token for the default service account from the GCE
/// metadata server.
#[derive(Debug, Clone)]
pub struct GcpTokenSource {
    client: reqwest::Client,
    endpoint: Url,
}

impl GcpTokenSource {
    /// Uses `GCE_METADATA_HOST` when set.
    pub fn new(client: reqwest::Client) -> Result<Self, CredentialError> {
        let host = std::env::var(GCE_METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_owned());
        Self::for_host(client, &host)
    }

    pub fn for_host(client: reqwest::Client, host: &str) -> Result<Self, CredentialError> {
        let endpoint = Url::parse(&format!("http://{host}{TOKEN_PATH}")).map_err(|e| {
            CredentialError::Unavailable(format!("invalid metadata host {host:?}: {e}"))
        })?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TokenSource for GcpTokenSource {
    fn provider(&self) -> &'static str {
        "gcp"
    }

    async fn fetch(&self) -> Result<CachedToken, CredentialError> {
        let request = self
            .client
            .get(self.endpoint.clone())
            .header("Metadata-Flavor", "Google");
        let (status, body) = get_text(request, self.endpoint.as_str()).await?;
        parse_bearer_token(
            self.endpoint.as_str(),
            status,
            &body,
            TokenLifetime::Optional,
        )
    }
}
