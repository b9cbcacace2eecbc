//! Boundary to the crypt engine.
//!
//! The engine owns every cryptographic decision. This crate only sees an
//! opaque context that reports a [`State`], accepts bytes and hands bytes back.
//! Adapters over a native binding implement these traits; tests use scripted
//! fakes.

use std::fmt;

use crate::options::{DataKeyOptions, EncryptOptions, KeyCacheExpiry, MasterKey};

/// Discrete state reported by an [`EngineContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Needs collection metadata for the command's target collection.
    NeedCollectionInfo,
    /// Same as [`State::NeedCollectionInfo`], with the database chosen by the engine.
    NeedCollectionInfoWithDb,
    /// Needs the command marked by the helper.
    NeedMarkings,
    /// Needs data keys from the key vault.
    NeedKeys,
    /// Has KMS requests to send.
    NeedKms,
    /// Needs credentials for providers configured for automatic retrieval.
    NeedKmsCredentials,
    Ready,
    Done,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::NeedCollectionInfo => "NEED_COLLECTION_INFO",
            State::NeedCollectionInfoWithDb => "NEED_COLLECTION_INFO_WITH_DB",
            State::NeedMarkings => "NEED_MARKINGS",
            State::NeedKeys => "NEED_KEYS",
            State::NeedKms => "NEED_KMS",
            State::NeedKmsCredentials => "NEED_KMS_CREDENTIALS",
            State::Ready => "READY",
            State::Done => "DONE",
            State::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Status reported by the engine when it refuses input or enters [`State::Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One operation in flight inside the engine.
///
/// A context is driven by exactly one loop and never shared; the driver takes
/// ownership and drops it when the loop exits.
pub trait EngineContext: Send {
    fn state(&self) -> State;

    /// Error status; meaningful once [`EngineContext::state`] is [`State::Error`].
    fn status(&self) -> EngineError;

    /// Drain the pending database operation: a filter for collection info and
    /// keys, the command for markings.
    fn mongo_operation(&mut self) -> Result<Vec<u8>, EngineError>;

    /// Database the pending operation targets.
    fn database(&self) -> Result<String, EngineError>;

    /// Feed one reply document for the pending database operation.
    fn feed(&mut self, reply: &[u8]) -> Result<(), EngineError>;

    fn finish_mongo_operation(&mut self) -> Result<(), EngineError>;

    /// Take every KMS request the engine currently has pending.
    fn take_kms_requests(&mut self) -> Result<Vec<Box<dyn KmsRequest>>, EngineError>;

    fn finish_kms_requests(&mut self) -> Result<(), EngineError>;

    /// Supply the credential document for providers configured for automatic retrieval.
    fn provide_kms_credentials(&mut self, credentials: &[u8]) -> Result<(), EngineError>;

    /// Produce the final bytes. Moves the context to [`State::Done`] or [`State::Error`].
    fn finalize(&mut self) -> Result<Vec<u8>, EngineError>;
}

/// A single request to a KMS endpoint.
pub trait KmsRequest: Send {
    /// Provider name, e.g. `aws` or `azure:backup`. Selects TLS options.
    fn provider(&self) -> &str;

    /// `host` or `host:port`; port defaults to 443.
    fn endpoint(&self) -> &str;

    /// Bytes to write to the endpoint.
    fn message(&self) -> &[u8];

    /// Bytes the engine still needs; zero once the response is complete.
    fn bytes_needed(&self) -> usize;

    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError>;
}

/// Factory for engine contexts, one per operation.
pub trait CryptEngine: Send + Sync {
    /// Set how long the engine keeps decrypted data keys. Sessions call this
    /// once, before creating any context.
    fn set_key_expiration(&self, expiry: KeyCacheExpiry) -> Result<(), EngineError>;

    fn encryption_context(
        &self,
        db: &str,
        command: &[u8],
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    fn decryption_context(&self, reply: &[u8]) -> Result<Box<dyn EngineContext>, EngineError>;

    fn data_key_context(
        &self,
        provider: &str,
        options: &DataKeyOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    fn rewrap_many_data_key_context(
        &self,
        filter: &[u8],
        provider: Option<&str>,
        master_key: Option<&MasterKey>,
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    /// `value` is a `{"v": <value>}` document.
    fn explicit_encryption_context(
        &self,
        value: &[u8],
        options: &EncryptOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    /// `expression` is a `{"v": <expression>}` document.
    fn explicit_encryption_expression_context(
        &self,
        expression: &[u8],
        options: &EncryptOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    /// `value` is a `{"v": <ciphertext>}` document.
    fn explicit_decryption_context(
        &self,
        value: &[u8],
    ) -> Result<Box<dyn EngineContext>, EngineError>;

    /// Version of the shared crypt library, when one is loaded. A loaded
    /// library makes the marking helper unnecessary.
    fn crypt_shared_version(&self) -> Option<String> {
        None
    }
}
