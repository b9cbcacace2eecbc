//! Drives a crypt engine context to completion.
//!
//! Each engine state maps to one I/O action. Every action runs under the
//! caller's [`OperationBudget`], and the loop fails instead of spinning when
//! the engine repeats a state after being fed the same bytes.

pub mod kms;
pub mod tls;

use std::sync::Arc;

use bson::{Document, RawDocumentBuf};
use futures::future::try_join_all;
use sha2::{Digest, Sha256};

pub use kms::{KmsConnector, KmsStream, KmsTransport, ProxyOptions, TlsKmsConnector};
pub use tls::{KmsTlsOptions, TlsOptions};

use crate::budget::OperationBudget;
use crate::client::{KeyVaultClient, MarkingClient, MetadataClient};
use crate::credentials::KmsCredentials;
use crate::engine::{EngineContext, EngineError, State};
use crate::error::{Error, IoAction, Result};
use crate::helper::HelperManager;
use crate::options::Namespace;

/// Client that marks commands, optionally backed by a supervised helper.
#[derive(Clone)]
pub struct Markings {
    client: Arc<dyn MarkingClient>,
    helper: Option<Arc<HelperManager>>,
}

impl Markings {
    pub fn new(client: Arc<dyn MarkingClient>, helper: Option<Arc<HelperManager>>) -> Self {
        Self { client, helper }
    }

    async fn mark(&self, db: &str, command: RawDocumentBuf) -> Result<RawDocumentBuf> {
        let (client, command) = (&self.client, &command);
        let call = move || async move {
            client
                .mark_command(db, command.clone())
                .await
                .map_err(|e| Error::io(IoAction::Markings, e))
        };
        match &self.helper {
            Some(helper) => helper.run_with_respawn(call).await,
            None => call().await,
        }
    }
}

/// Executes engine contexts against the database, the helper and KMS.
#[derive(Clone)]
pub struct StateMachine {
    key_vault: Arc<dyn KeyVaultClient>,
    key_vault_namespace: Namespace,
    metadata: Option<Arc<dyn MetadataClient>>,
    markings: Option<Markings>,
    credentials: Arc<KmsCredentials>,
    kms: KmsTransport,
}

impl StateMachine {
    pub fn new(
        key_vault: Arc<dyn KeyVaultClient>,
        key_vault_namespace: Namespace,
        credentials: Arc<KmsCredentials>,
        kms: KmsTransport,
    ) -> Self {
        Self {
            key_vault,
            key_vault_namespace,
            metadata: None,
            markings: None,
            credentials,
            kms,
        }
    }

    pub fn with_metadata_client(mut self, metadata: Arc<dyn MetadataClient>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_markings(mut self, markings: Markings) -> Self {
        self.markings = Some(markings);
        self
    }

    pub fn credentials(&self) -> &KmsCredentials {
        &self.credentials
    }

    /// Run `context` until it reaches a terminal state and return the bytes
    /// it produced when it was ready. Contexts that finish without producing
    /// output yield an empty buffer.
    pub async fn execute(
        &self,
        mut context: Box<dyn EngineContext>,
        budget: &OperationBudget,
    ) -> Result<Vec<u8>> {
        let mut guard = ProgressGuard::default();
        let mut output = None;
        loop {
            let state = context.state();
            tracing::trace!(%state, "crypt engine state");
            let mut fed = Fingerprint::new();
            match state {
                State::NeedCollectionInfo | State::NeedCollectionInfoWithDb => {
                    self.collection_info(context.as_mut(), state, budget, &mut fed)
                        .await?;
                }
                State::NeedMarkings => {
                    self.markings(context.as_mut(), budget, &mut fed).await?;
                }
                State::NeedKeys => self.keys(context.as_mut(), budget, &mut fed).await?,
                State::NeedKms => self.kms(context.as_mut(), budget, &mut fed).await?,
                State::NeedKmsCredentials => {
                    self.kms_credentials(context.as_mut(), budget, &mut fed)
                        .await?;
                }
                State::Ready => {
                    let bytes = context.finalize().map_err(|e| Error::engine(state, e))?;
                    fed.record(&bytes);
                    output = Some(bytes);
                }
                State::Done => return Ok(output.unwrap_or_default()),
                State::Error => return Err(Error::engine(state, context.status())),
            }
            guard.advance(state, fed.finish())?;
        }
    }

    async fn collection_info(
        &self,
        context: &mut dyn EngineContext,
        state: State,
        budget: &OperationBudget,
        fed: &mut Fingerprint,
    ) -> Result<()> {
        let metadata = self.metadata.as_ref().ok_or_else(|| {
            Error::configuration("collection info is needed but no metadata client is configured")
        })?;
        let filter = operation_document(context, state)?;
        let db = context.database().map_err(|e| Error::engine(state, e))?;

        let infos = budget
            .run(IoAction::CollectionInfo, async {
                metadata
                    .list_collections(&db, filter)
                    .await
                    .map_err(|e| Error::io(IoAction::CollectionInfo, e))
            })
            .await?;
        match infos.first() {
            Some(info) => feed(context, state, fed, info.as_bytes())?,
            None => tracing::debug!(%db, "no collection info found, continuing without a schema"),
        }
        context
            .finish_mongo_operation()
            .map_err(|e| Error::engine(state, e))
    }

    async fn markings(
        &self,
        context: &mut dyn EngineContext,
        budget: &OperationBudget,
        fed: &mut Fingerprint,
    ) -> Result<()> {
        let state = State::NeedMarkings;
        let markings = self.markings.as_ref().ok_or_else(|| {
            Error::configuration("command marking is needed but no marking client is configured")
        })?;
        let command = context
            .mongo_operation()
            .map_err(|e| Error::engine(state, e))
            .and_then(|bytes| RawDocumentBuf::from_bytes(bytes).map_err(Error::bson))?;
        let db = context.database().map_err(|e| Error::engine(state, e))?;

        let marked = budget
            .run(IoAction::Markings, markings.mark(&db, command))
            .await?;
        feed(context, state, fed, marked.as_bytes())?;
        context
            .finish_mongo_operation()
            .map_err(|e| Error::engine(state, e))
    }

    async fn keys(
        &self,
        context: &mut dyn EngineContext,
        budget: &OperationBudget,
        fed: &mut Fingerprint,
    ) -> Result<()> {
        let state = State::NeedKeys;
        let filter = operation_document(context, state)?;
        let keys = budget
            .run(IoAction::Keys, async {
                self.key_vault
                    .find(&self.key_vault_namespace, filter)
                    .await
                    .map_err(|e| Error::io(IoAction::Keys, e))
            })
            .await?;
        tracing::debug!(count = keys.len(), "fetched data keys");
        for key in &keys {
            feed(context, state, fed, key.as_bytes())?;
        }
        context
            .finish_mongo_operation()
            .map_err(|e| Error::engine(state, e))
    }

    async fn kms(
        &self,
        context: &mut dyn EngineContext,
        budget: &OperationBudget,
        fed: &mut Fingerprint,
    ) -> Result<()> {
        let state = State::NeedKms;
        let requests = context
            .take_kms_requests()
            .map_err(|e| Error::engine(state, e))?;
        tracing::debug!(count = requests.len(), "dispatching KMS requests");

        let responses = budget
            .run(
                IoAction::Kms,
                try_join_all(requests.into_iter().map(|request| self.kms.send(request))),
            )
            .await?;
        for response in &responses {
            fed.record(response);
        }
        context
            .finish_kms_requests()
            .map_err(|e| Error::engine(state, e))
    }

    async fn kms_credentials(
        &self,
        context: &mut dyn EngineContext,
        budget: &OperationBudget,
        fed: &mut Fingerprint,
    ) -> Result<()> {
        let state = State::NeedKmsCredentials;
        let providers = budget
            .run(IoAction::KmsCredentials, self.credentials.refresh())
            .await?;
        let bytes = bson::to_vec(&providers).map_err(Error::bson)?;
        fed.record(&bytes);
        context
            .provide_kms_credentials(&bytes)
            .map_err(|e| Error::engine(state, e))
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("key_vault_namespace", &self.key_vault_namespace)
            .field("metadata", &self.metadata.is_some())
            .field("markings", &self.markings.is_some())
            .finish_non_exhaustive()
    }
}

fn operation_document(context: &mut dyn EngineContext, state: State) -> Result<Document> {
    let bytes = context
        .mongo_operation()
        .map_err(|e| Error::engine(state, e))?;
    Document::from_reader(bytes.as_slice()).map_err(Error::bson)
}

fn feed(
    context: &mut dyn EngineContext,
    state: State,
    fed: &mut Fingerprint,
    bytes: &[u8],
) -> Result<()> {
    fed.record(bytes);
    context.feed(bytes).map_err(|e| Error::engine(state, e))
}

/// Digest of everything fed to the engine during one state.
struct Fingerprint(Sha256);

impl Fingerprint {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn record(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// Fails when the engine reports the same state twice in a row after being
/// fed identical bytes.
#[derive(Default)]
struct ProgressGuard {
    last: Option<(State, [u8; 32])>,
}

impl ProgressGuard {
    fn advance(&mut self, state: State, fingerprint: [u8; 32]) -> Result<()> {
        let step = (state, fingerprint);
        tracing::trace!(%state, input = %hex::encode(&fingerprint[..8]), "state step");
        if self.last == Some(step) {
            return Err(Error::engine(
                state,
                EngineError::new(-1, "engine made no progress after identical input"),
            ));
        }
        self.last = Some(step);
        Ok(())
    }
}
