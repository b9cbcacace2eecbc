use std::sync::Arc;

use bson::{RawDocument, RawDocumentBuf};

use super::SessionTransport;
use crate::budget::OperationBudget;
use crate::client::{KeyVaultClient, MarkingClient, MetadataClient};
use crate::engine::{CryptEngine, State};
use crate::error::{Error, Result};
use crate::helper::{ClientProbe, HelperManager, TokioLauncher};
use crate::options::AutoEncryptionOptions;
use crate::state_machine::{Markings, StateMachine};

/// Database clients the auto encrypter talks to.
#[derive(Clone)]
pub struct AutoEncrypterClients {
    pub key_vault: Arc<dyn KeyVaultClient>,
    pub metadata: Arc<dyn MetadataClient>,
    /// Connection to the marking helper; not needed when query analysis is
    /// bypassed or a shared crypt library is loaded.
    pub marking: Option<Arc<dyn MarkingClient>>,
}

/// Encrypts outgoing commands and decrypts replies transparently.
pub struct AutoEncrypter {
    options: AutoEncryptionOptions,
    engine: Arc<dyn CryptEngine>,
    helper: Option<Arc<HelperManager>>,
    state_machine: StateMachine,
}

impl AutoEncrypter {
    pub fn new(
        options: AutoEncryptionOptions,
        engine: Arc<dyn CryptEngine>,
        clients: AutoEncrypterClients,
    ) -> Result<Self> {
        options.validate()?;
        let transport = SessionTransport::from_options(&options.encryption)?;
        let helper = match &clients.marking {
            Some(marking) if helper_required(&options, engine.as_ref()) => {
                let probe = ClientProbe::new(marking.clone(), options.helper.probe_timeout);
                Some(Arc::new(HelperManager::new(
                    options.helper.clone(),
                    Arc::new(probe),
                    Arc::new(TokioLauncher::new()),
                )))
            }
            _ => None,
        };
        Self::with_transport(options, engine, clients, transport, helper)
    }

    /// Build with explicit collaborators. `helper` is ignored when the
    /// helper is not required.
    pub fn with_transport(
        options: AutoEncryptionOptions,
        engine: Arc<dyn CryptEngine>,
        clients: AutoEncrypterClients,
        transport: SessionTransport,
        helper: Option<Arc<HelperManager>>,
    ) -> Result<Self> {
        options.validate()?;
        let required = helper_required(&options, engine.as_ref());
        if required && clients.marking.is_none() {
            return Err(Error::configuration(
                "a marking client is required unless query analysis is bypassed",
            ));
        }
        let helper = helper.filter(|_| required);
        engine
            .set_key_expiration(options.encryption.key_expiration)
            .map_err(|e| Error::engine(State::Error, e))?;

        let mut state_machine = StateMachine::new(
            clients.key_vault,
            options.encryption.key_vault_namespace.clone(),
            transport.credentials,
            transport.kms,
        )
        .with_metadata_client(clients.metadata);
        if let Some(marking) = clients.marking {
            state_machine = state_machine.with_markings(Markings::new(marking, helper.clone()));
        }

        Ok(Self {
            options,
            engine,
            helper,
            state_machine,
        })
    }

    /// Make sure the helper is running, if one is needed.
    pub async fn init(&self) -> Result<()> {
        match &self.helper {
            Some(helper) => helper.ensure_running().await,
            None => Ok(()),
        }
    }

    /// Encrypt `command` bound for `db`. Returned unchanged when auto
    /// encryption is bypassed.
    pub async fn encrypt(
        &self,
        db: &str,
        command: &RawDocument,
        budget: &OperationBudget,
    ) -> Result<RawDocumentBuf> {
        if self.options.bypass_auto_encryption {
            return Ok(command.to_raw_document_buf());
        }
        let context = self
            .engine
            .encryption_context(db, command.as_bytes())
            .map_err(|e| Error::engine(State::Error, e))?;
        let encrypted = self.state_machine.execute(context, budget).await?;
        RawDocumentBuf::from_bytes(encrypted).map_err(Error::bson)
    }

    /// Decrypt every encrypted field in `reply`.
    pub async fn decrypt(
        &self,
        reply: &RawDocument,
        budget: &OperationBudget,
    ) -> Result<RawDocumentBuf> {
        let context = self
            .engine
            .decryption_context(reply.as_bytes())
            .map_err(|e| Error::engine(State::Error, e))?;
        let decrypted = self.state_machine.execute(context, budget).await?;
        RawDocumentBuf::from_bytes(decrypted).map_err(Error::bson)
    }

    pub fn crypt_shared_version(&self) -> Option<String> {
        self.engine.crypt_shared_version()
    }

    pub fn helper(&self) -> Option<&Arc<HelperManager>> {
        self.helper.as_ref()
    }

    /// Stop a helper this session started.
    pub async fn close(&self) {
        if let Some(helper) = &self.helper {
            helper.shutdown().await;
        }
    }
}

impl std::fmt::Debug for AutoEncrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoEncrypter")
            .field("options", &self.options)
            .field("helper", &self.helper)
            .finish_non_exhaustive()
    }
}

fn helper_required(options: &AutoEncryptionOptions, engine: &dyn CryptEngine) -> bool {
    !options.bypass_auto_encryption
        && !options.bypass_query_analysis
        && engine.crypt_shared_version().is_none()
}
