use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::client::MarkingClient;
use crate::error::{ClientError, ClientErrorKind};

/// Answers "is the helper accepting requests right now".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ClientError>;
}

/// Round trip through the marking client.
pub struct ClientProbe {
    client: Arc<dyn MarkingClient>,
    timeout: Duration,
}

impl ClientProbe {
    pub fn new(client: Arc<dyn MarkingClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl LivenessProbe for ClientProbe {
    async fn probe(&self) -> Result<(), ClientError> {
        tokio::time::timeout(self.timeout, self.client.ping())
            .await
            .map_err(|_| ClientError::new(ClientErrorKind::Timeout, "helper ping timed out"))?
    }
}

/// Plain TCP connect to the helper's listening address.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self) -> Result<(), ClientError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ClientError::new(
                ClientErrorKind::Timeout,
                format!("connecting to {}:{} timed out", self.host, self.port),
            )),
        }
    }
}
