//! Caller-facing sessions: automatic command encryption and the explicit
//! key management / value encryption API.

mod auto;
mod explicit;

use std::sync::Arc;

use bson::Document;

pub use auto::{AutoEncrypter, AutoEncrypterClients};
pub use explicit::{
    ClientEncryption, CreateEncryptedCollectionOptions, DeleteOutcome, RewrapManyDataKeyResult,
};

use crate::credentials::KmsCredentials;
use crate::error::{Error, Result};
use crate::options::EncryptionOptions;
use crate::state_machine::KmsTransport;

/// How a session reaches KMS: credential resolution and the connection layer.
#[derive(Debug, Clone)]
pub struct SessionTransport {
    pub credentials: Arc<KmsCredentials>,
    pub kms: KmsTransport,
}

impl SessionTransport {
    /// Provider endpoints for auto credentials, TLS sockets for KMS.
    pub fn from_options(options: &EncryptionOptions) -> Result<Self> {
        let credentials =
            KmsCredentials::new(options.kms_providers.clone(), options.credential_timeout)?;
        let kms = KmsTransport::tls(&options.tls_options, options.proxy.clone())?;
        Ok(Self {
            credentials: Arc::new(credentials),
            kms,
        })
    }
}

pub(crate) fn to_document(bytes: &[u8]) -> Result<Document> {
    Document::from_reader(bytes).map_err(Error::bson)
}

pub(crate) fn to_bytes(document: &Document) -> Result<Vec<u8>> {
    bson::to_vec(document).map_err(Error::bson)
}
