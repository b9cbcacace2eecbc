use std::fmt;

use bson::Document;

use crate::engine::{EngineError, State};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error carried by collaborators we do not own.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can go wrong while orchestrating an encryption operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("crypt engine failed in state {state}: {source}")]
    Engine {
        state: State,
        #[source]
        source: EngineError,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{action} failed: {source}")]
    Io {
        action: IoAction,
        #[source]
        source: ClientError,
    },

    #[error("helper process {path} did not become ready: {reason}")]
    HelperSpawn { path: String, reason: String },

    #[error("failed to obtain {provider} credentials: {source}")]
    Credential {
        provider: String,
        #[source]
        source: CredentialError,
    },

    #[error("operation timed out before {action} completed")]
    Timeout { action: IoAction },

    #[error("operation cancelled during {action}")]
    Cancelled { action: IoAction },

    #[error("unable to create encrypted collection: {source}")]
    CreateEncryptedCollection {
        /// `encryptedFields` including every data key created before the failure.
        encrypted_fields: Document,
        #[source]
        source: Box<Error>,
    },

    #[error("malformed document: {0}")]
    Bson(String),
}

impl Error {
    pub(crate) fn io(action: IoAction, source: impl Into<ClientError>) -> Self {
        Error::Io {
            action,
            source: source.into(),
        }
    }

    pub(crate) fn engine(state: State, source: EngineError) -> Self {
        Error::Engine { state, source }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn bson(err: impl fmt::Display) -> Self {
        Error::Bson(err.to_string())
    }

    /// True when the failure means nothing was listening on the other end,
    /// the signal the helper manager uses to decide on a respawn.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            Error::Io { source, .. } if source.kind == ClientErrorKind::ConnectionRefused
        )
    }

    /// The I/O action that was in progress, if the failure is tied to one.
    pub fn action(&self) -> Option<IoAction> {
        match self {
            Error::Io { action, .. } | Error::Timeout { action } | Error::Cancelled { action } => {
                Some(*action)
            }
            Error::CreateEncryptedCollection { source, .. } => source.action(),
            _ => None,
        }
    }
}

/// The I/O the driver or a session was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoAction {
    CollectionInfo,
    Markings,
    Keys,
    Kms,
    KmsCredentials,
    KeyVaultWrite,
    CreateCollection,
}

impl fmt::Display for IoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoAction::CollectionInfo => "collection info lookup",
            IoAction::Markings => "command marking",
            IoAction::Keys => "key vault lookup",
            IoAction::Kms => "KMS request",
            IoAction::KmsCredentials => "KMS credential refresh",
            IoAction::KeyVaultWrite => "key vault write",
            IoAction::CreateCollection => "collection creation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientErrorKind {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out")]
    Timeout,
    #[error("TLS failure")]
    Tls,
    #[error("request failed")]
    Other,
}

/// Failure reported by a database client, socket or subprocess call.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {source}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    #[source]
    pub source: BoxError,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn other(source: impl Into<BoxError>) -> Self {
        Self::new(ClientErrorKind::Other, source)
    }

    pub fn connection_refused(source: impl Into<BoxError>) -> Self {
        Self::new(ClientErrorKind::ConnectionRefused, source)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::ConnectionRefused => ClientErrorKind::ConnectionRefused,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ClientErrorKind::ConnectionClosed,
            std::io::ErrorKind::TimedOut => ClientErrorKind::Timeout,
            _ => ClientErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Failure fetching a credential from a provider endpoint.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },

    #[error("{endpoint} responded with status {status}: {body}")]
    Endpoint {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("malformed credential response: {0}")]
    Malformed(String),

    #[error("no credentials available: {0}")]
    Unavailable(String),
}
