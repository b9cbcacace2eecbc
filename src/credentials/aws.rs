//! AWS credentials: environment, then the ECS task endpoint, then EC2 IMDSv2.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroizing;

use super::cache::{CachedToken, Credential, Expiry, TokenSource};
use super::get_text;
use crate::error::CredentialError;

pub const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";
pub const ECS_RELATIVE_URI_ENV: &str = "AWS_CONTAINER_CREDENTIALS_RELATIVE_URI";

const ECS_HOST: &str = "http://169.254.170.2";
const IMDS_HOST: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "30";

/// Credential chain for the `aws` provider.
#[derive(Debug, Clone)]
pub struct AwsCredentialSource {
    client: reqwest::Client,
    ecs_host: String,
    imds_host: String,
    env: fn(&str) -> Option<String>,
}

impl AwsCredentialSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            ecs_host: ECS_HOST.to_owned(),
            imds_host: IMDS_HOST.to_owned(),
            env: |name| std::env::var(name).ok(),
        }
    }

    /// Point the ECS and IMDS lookups at other hosts.
    pub fn with_hosts(mut self, ecs_host: impl Into<String>, imds_host: impl Into<String>) -> Self {
        self.ecs_host = ecs_host.into();
        self.imds_host = imds_host.into();
        self
    }

    pub fn with_env(mut self, env: fn(&str) -> Option<String>) -> Self {
        self.env = env;
        self
    }

    async fn from_ecs(&self, relative_uri: &str) -> Result<CachedToken, CredentialError> {
        let endpoint = format!("{}{relative_uri}", self.ecs_host);
        let (status, body) = get_text(self.client.get(&endpoint), &endpoint).await?;
        ensure_ok(&endpoint, status, &body)?;
        parse_credentials_document(&body)
    }

    async fn from_imds(&self) -> Result<CachedToken, CredentialError> {
        let token_endpoint = format!("{}/latest/api/token", self.imds_host);
        let request = self
            .client
            .put(&token_endpoint)
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS);
        let (status, token) = get_text(request, &token_endpoint).await?;
        ensure_ok(&token_endpoint, status, &token)?;

        let roles_endpoint = format!("{}/latest/meta-data/iam/security-credentials/", self.imds_host);
        let request = self
            .client
            .get(&roles_endpoint)
            .header("X-aws-ec2-metadata-token", token.trim());
        let (status, roles) = get_text(request, &roles_endpoint).await?;
        ensure_ok(&roles_endpoint, status, &roles)?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| CredentialError::Unavailable("no IAM role attached to instance".into()))?;

        let endpoint = format!("{roles_endpoint}{role}");
        let request = self
            .client
            .get(&endpoint)
            .header("X-aws-ec2-metadata-token", token.trim());
        let (status, body) = get_text(request, &endpoint).await?;
        ensure_ok(&endpoint, status, &body)?;
        parse_credentials_document(&body)
    }
}

#[async_trait]
impl TokenSource for AwsCredentialSource {
    fn provider(&self) -> &'static str {
        "aws"
    }

    async fn fetch(&self) -> Result<CachedToken, CredentialError> {
        if let Some(credential) = credentials_from_env(self.env) {
            tracing::debug!("using AWS credentials from the environment");
            return Ok(CachedToken::new(credential, Expiry::Never));
        }
        match (self.env)(ECS_RELATIVE_URI_ENV).filter(|uri| !uri.is_empty()) {
            Some(relative_uri) => self.from_ecs(&relative_uri).await,
            None => self.from_imds().await,
        }
    }
}

/// Static credentials from `AWS_ACCESS_KEY_ID` and `AWS_SECRET_ACCESS_KEY`.
pub fn credentials_from_env(env: impl Fn(&str) -> Option<String>) -> Option<Credential> {
    let non_empty = |name: &str| env(name).filter(|v| !v.is_empty());
    let access_key_id = non_empty(ACCESS_KEY_ID_ENV)?;
    let secret_access_key = non_empty(SECRET_ACCESS_KEY_ENV)?;
    Some(Credential::Aws {
        access_key_id,
        secret_access_key: Zeroizing::new(secret_access_key),
        session_token: non_empty(SESSION_TOKEN_ENV).map(Zeroizing::new),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsDocument {
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    token: Option<String>,
    expiration: Option<String>,
}

/// Parse the JSON returned by the ECS and IMDS credential endpoints.
pub fn parse_credentials_document(body: &str) -> Result<CachedToken, CredentialError> {
    let document: CredentialsDocument =
        serde_json::from_str(body).map_err(|e| CredentialError::Malformed(e.to_string()))?;
    let (Some(access_key_id), Some(secret_access_key)) =
        (document.access_key_id, document.secret_access_key)
    else {
        return Err(CredentialError::Malformed(
            "missing AccessKeyId or SecretAccessKey".into(),
        ));
    };
    let credential = Credential::Aws {
        access_key_id,
        secret_access_key: Zeroizing::new(secret_access_key),
        session_token: document.token.map(Zeroizing::new),
    };
    let Some(expiration) = document.expiration else {
        return Ok(CachedToken::new(credential, Expiry::Never));
    };
    let expires_at = DateTime::parse_from_rfc3339(&expiration)
        .map_err(|e| CredentialError::Malformed(format!("Expiration {expiration:?}: {e}")))?;
    let remaining = (expires_at.with_timezone(&Utc) - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    Ok(CachedToken::expiring_in(credential, remaining))
}

fn ensure_ok(endpoint: &str, status: u16, body: &str) -> Result<(), CredentialError> {
    if status == 200 {
        Ok(())
    } else {
        Err(CredentialError::Endpoint {
            endpoint: endpoint.to_owned(),
            status,
            body: body.to_owned(),
        })
    }
}
