use async_trait::async_trait;

use super::cache::{CachedToken, TokenSource};
use super::{TokenLifetime, get_text, parse_bearer_token};
use crate::error::CredentialError;

/// Instance metadata token endpoint for managed identities.
pub const AZURE_IMDS_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const API_VERSION: &str = "2018-02-01";
const RESOURCE: &str = "https://vault.azure.net";

/// Fetches a Key Vault access token from the Azure instance metadata service.
#[derive(Debug, Clone)]
pub struct AzureTokenSource {
    client: reqwest::Client,
    endpoint: String,
}

impl AzureTokenSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, AZURE_IMDS_URL)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn request(&self) -> reqwest::RequestBuilder {
        self.client
            .get(&self.endpoint)
            .query(&[("api-version", API_VERSION), ("resource", RESOURCE)])
            .header("Metadata", "true")
            .header("Accept", "application/json")
    }
}

#[async_trait]
impl TokenSource for AzureTokenSource {
    fn provider(&self) -> &'static str {
        "azure"
    }

    async fn fetch(&self) -> Result<CachedToken, CredentialError> {
        let (status, body) = get_text(self.request(), &self.endpoint).await?;
        parse_bearer_token(&self.endpoint, status, &body, TokenLifetime::Required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_metadata_header_and_query() {
        let source = AzureTokenSource::new(reqwest::Client::new());
        let request = source.request().build().unwrap();

        assert_eq!(request.url().host_str(), Some("169.254.169.254"));
        let query = request.url().query().unwrap();
        assert!(query.contains("api-version=2018-02-01"));
        assert!(query.contains("resource=https%3A%2F%2Fvault.azure.net"));
        assert_eq!(request.headers()["Metadata"], "true");
    }
}
