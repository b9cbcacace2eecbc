//! In-memory engine, database clients, helper process and KMS endpoints
//! shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, RawDocumentBuf, doc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Barrier, watch};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use field_crypt::client::{
    BulkWriteOutcome, KeyVaultClient, MarkingClient, MetadataClient, UpdateModifications,
    UpdateOne,
};
use field_crypt::credentials::{CachedToken, Credential, Expiry, KmsCredentials, KmsProviders, TokenSource};
use field_crypt::engine::{CryptEngine, EngineContext, EngineError, KmsRequest, State};
use field_crypt::error::{ClientError, CredentialError};
use field_crypt::helper::{HelperProcess, LivenessProbe, ProcessLauncher};
use field_crypt::options::{DataKeyOptions, EncryptOptions, KeyCacheExpiry, MasterKey, Namespace};
use field_crypt::state_machine::{KmsConnector, KmsStream, KmsTransport};

pub fn key_vault_namespace() -> Namespace {
    Namespace::new("encryption", "__keyVault")
}

pub fn uuid(byte: u8) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: vec![byte; 16],
    }
}

pub fn to_bytes(document: &Document) -> Vec<u8> {
    bson::to_vec(document).unwrap()
}

pub fn raw(document: &Document) -> RawDocumentBuf {
    RawDocumentBuf::from_document(document).unwrap()
}

pub fn data_key(id: u8, alt_names: &[&str]) -> Document {
    let mut key = doc! {
        "_id": uuid(id),
        "keyMaterial": Binary { subtype: BinarySubtype::Generic, bytes: vec![id; 8] },
        "masterKey": { "provider": "local" },
    };
    if !alt_names.is_empty() {
        key.insert("keyAltNames", alt_names.to_vec());
    }
    key
}

/// Credentials that never touch the network.
pub fn static_credentials(providers: KmsProviders) -> Arc<KmsCredentials> {
    Arc::new(KmsCredentials::with_sources(providers, Vec::new()))
}

// ---------------------------------------------------------------------------
// Scripted engine

#[derive(Debug, Clone)]
pub struct KmsSpec {
    pub provider: String,
    pub endpoint: String,
    pub message: Vec<u8>,
    pub response_len: usize,
}

impl KmsSpec {
    pub fn new(provider: &str, endpoint: &str, response_len: usize) -> Self {
        Self {
            provider: provider.to_owned(),
            endpoint: endpoint.to_owned(),
            message: format!("POST / HTTP/1.1\r\nHost: {endpoint}\r\n\r\n").into_bytes(),
            response_len,
        }
    }
}

/// One state the scripted context passes through.
#[derive(Debug, Clone)]
pub enum Step {
    CollectionInfo(Document),
    Markings,
    Keys(Document),
    Kms(Vec<KmsSpec>),
    KmsCredentials,
    Ready(Document),
    Fail(EngineError),
}

impl Step {
    fn state(&self) -> State {
        match self {
            Step::CollectionInfo(_) => State::NeedCollectionInfo,
            Step::Markings => State::NeedMarkings,
            Step::Keys(_) => State::NeedKeys,
            Step::Kms(_) => State::NeedKms,
            Step::KmsCredentials => State::NeedKmsCredentials,
            Step::Ready(_) => State::Ready,
            Step::Fail(_) => State::Error,
        }
    }
}

/// What the driver did to the contexts.
#[derive(Debug, Default)]
pub struct EngineLog {
    pub contexts: Vec<String>,
    pub operations: Vec<(State, Document)>,
    pub fed: Vec<(State, Vec<u8>)>,
    pub kms_responses: Vec<Vec<u8>>,
    pub credentials: Vec<Document>,
    pub key_expiration: Option<KeyCacheExpiry>,
}

pub struct ScriptedContext {
    steps: VecDeque<Step>,
    db: String,
    command: Vec<u8>,
    stuck: bool,
    pending_kms: Vec<Arc<Mutex<Vec<u8>>>>,
    log: Arc<Mutex<EngineLog>>,
}

impl ScriptedContext {
    fn current(&self) -> Option<&Step> {
        self.steps.front()
    }

    fn advance(&mut self) {
        if !self.stuck {
            self.steps.pop_front();
        }
    }
}

impl EngineContext for ScriptedContext {
    fn state(&self) -> State {
        self.current().map_or(State::Done, Step::state)
    }

    fn status(&self) -> EngineError {
        match self.current() {
            Some(Step::Fail(err)) => err.clone(),
            _ => EngineError::new(0, "ok"),
        }
    }

    fn mongo_operation(&mut self) -> Result<Vec<u8>, EngineError> {
        let state = self.state();
        let operation = match self.current() {
            Some(Step::CollectionInfo(filter)) | Some(Step::Keys(filter)) => filter.clone(),
            Some(Step::Markings) => Document::from_reader(self.command.as_slice())
                .map_err(|e| EngineError::new(1, e.to_string()))?,
            _ => return Err(EngineError::new(1, "no pending database operation")),
        };
        self.log
            .lock()
            .unwrap()
            .operations
            .push((state, operation.clone()));
        Ok(to_bytes(&operation))
    }

    fn database(&self) -> Result<String, EngineError> {
        Ok(self.db.clone())
    }

    fn feed(&mut self, reply: &[u8]) -> Result<(), EngineError> {
        let state = self.state();
        self.log.lock().unwrap().fed.push((state, reply.to_vec()));
        Ok(())
    }

    fn finish_mongo_operation(&mut self) -> Result<(), EngineError> {
        self.advance();
        Ok(())
    }

    fn take_kms_requests(&mut self) -> Result<Vec<Box<dyn KmsRequest>>, EngineError> {
        let Some(Step::Kms(specs)) = self.current() else {
            return Err(EngineError::new(1, "no pending KMS requests"));
        };
        let specs = specs.clone();
        self.pending_kms.clear();
        let mut requests: Vec<Box<dyn KmsRequest>> = Vec::with_capacity(specs.len());
        for spec in specs {
            let received = Arc::new(Mutex::new(Vec::new()));
            self.pending_kms.push(received.clone());
            requests.push(Box::new(ScriptedKmsRequest { spec, received }));
        }
        Ok(requests)
    }

    fn finish_kms_requests(&mut self) -> Result<(), EngineError> {
        let mut log = self.log.lock().unwrap();
        for received in self.pending_kms.drain(..) {
            log.kms_responses.push(received.lock().unwrap().clone());
        }
        drop(log);
        self.advance();
        Ok(())
    }

    fn provide_kms_credentials(&mut self, credentials: &[u8]) -> Result<(), EngineError> {
        let document = Document::from_reader(credentials)
            .map_err(|e| EngineError::new(1, e.to_string()))?;
        self.log.lock().unwrap().credentials.push(document);
        self.advance();
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>, EngineError> {
        let Some(Step::Ready(output)) = self.current() else {
            return Err(EngineError::new(1, "not ready"));
        };
        let bytes = to_bytes(output);
        self.advance();
        Ok(bytes)
    }
}

struct ScriptedKmsRequest {
    spec: KmsSpec,
    received: Arc<Mutex<Vec<u8>>>,
}

impl KmsRequest for ScriptedKmsRequest {
    fn provider(&self) -> &str {
        &self.spec.provider
    }

    fn endpoint(&self) -> &str {
        &self.spec.endpoint
    }

    fn message(&self) -> &[u8] {
        &self.spec.message
    }

    fn bytes_needed(&self) -> usize {
        self.spec
            .response_len
            .saturating_sub(self.received.lock().unwrap().len())
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.received.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

/// Hands out contexts that follow pre-recorded scripts, one queue per kind
/// of operation. The last script of a queue is reused.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<&'static str, VecDeque<Vec<Step>>>>,
    pub log: Arc<Mutex<EngineLog>>,
    pub stuck: AtomicBool,
    pub shared_version: Option<String>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_library(version: &str) -> Self {
        Self {
            shared_version: Some(version.to_owned()),
            ..Self::default()
        }
    }

    pub fn script(&self, kind: &'static str, steps: Vec<Step>) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(steps);
        self
    }

    pub fn contexts(&self) -> Vec<String> {
        self.log.lock().unwrap().contexts.clone()
    }

    fn context(
        &self,
        kind: &'static str,
        label: String,
        db: &str,
        command: &[u8],
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        let steps = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(kind)
                .ok_or_else(|| EngineError::new(2, format!("no script for {kind}")))?;
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            next.ok_or_else(|| EngineError::new(2, format!("no script for {kind}")))?
        };
        self.log.lock().unwrap().contexts.push(label);
        Ok(Box::new(ScriptedContext {
            steps: steps.into(),
            db: db.to_owned(),
            command: command.to_vec(),
            stuck: self.stuck.load(Ordering::SeqCst),
            pending_kms: Vec::new(),
            log: self.log.clone(),
        }))
    }
}

impl CryptEngine for ScriptedEngine {
    fn set_key_expiration(&self, expiry: KeyCacheExpiry) -> Result<(), EngineError> {
        self.log.lock().unwrap().key_expiration = Some(expiry);
        Ok(())
    }

    fn encryption_context(
        &self,
        db: &str,
        command: &[u8],
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        self.context("encrypt", format!("encrypt:{db}"), db, command)
    }

    fn decryption_context(&self, reply: &[u8]) -> Result<Box<dyn EngineContext>, EngineError> {
        self.context("decrypt", "decrypt".into(), "", reply)
    }

    fn data_key_context(
        &self,
        provider: &str,
        _options: &DataKeyOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        self.context("data_key", format!("data_key:{provider}"), "", &[])
    }

    fn rewrap_many_data_key_context(
        &self,
        filter: &[u8],
        provider: Option<&str>,
        _master_key: Option<&MasterKey>,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        let label = format!("rewrap:{}", provider.unwrap_or("current"));
        self.context("rewrap", label, "", filter)
    }

    fn explicit_encryption_context(
        &self,
        value: &[u8],
        options: &EncryptOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        let label = format!("explicit_encrypt:{}", options.algorithm.as_str());
        self.context("explicit_encrypt", label, "", value)
    }

    fn explicit_encryption_expression_context(
        &self,
        expression: &[u8],
        options: &EncryptOptions,
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        let label = format!("explicit_expression:{}", options.algorithm.as_str());
        self.context("explicit_expression", label, "", expression)
    }

    fn explicit_decryption_context(
        &self,
        value: &[u8],
    ) -> Result<Box<dyn EngineContext>, EngineError> {
        self.context("explicit_decrypt", "explicit_decrypt".into(), "", value)
    }

    fn crypt_shared_version(&self) -> Option<String> {
        self.shared_version.clone()
    }
}

// ---------------------------------------------------------------------------
// Database clients

#[derive(Default)]
pub struct FakeKeyVault {
    pub keys: Mutex<Vec<Document>>,
    pub bulk_updates: Mutex<Vec<UpdateOne>>,
    pub pipelines: Mutex<Vec<Vec<Document>>>,
    pub finds: AtomicUsize,
    pub fail_inserts_after: Mutex<Option<usize>>,
}

impl FakeKeyVault {
    pub fn with_keys(keys: Vec<Document>) -> Self {
        Self {
            keys: Mutex::new(keys),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<Document> {
        self.keys.lock().unwrap().clone()
    }

    fn matches(key: &Document, filter: &Document) -> bool {
        filter.iter().all(|(name, expected)| match (name.as_str(), key.get(name)) {
            ("keyAltNames", Some(Bson::Array(names))) => names.contains(expected),
            (_, Some(actual)) => actual == expected,
            (_, None) => false,
        })
    }
}

#[async_trait]
impl KeyVaultClient for FakeKeyVault {
    async fn find(
        &self,
        _namespace: &Namespace,
        filter: Document,
    ) -> Result<Vec<RawDocumentBuf>, ClientError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .filter(|key| Self::matches(key, &filter))
            .map(raw)
            .collect())
    }

    async fn insert_one(&self, _namespace: &Namespace, document: Document) -> Result<(), ClientError> {
        let mut keys = self.keys.lock().unwrap();
        if let Some(limit) = *self.fail_inserts_after.lock().unwrap()
            && keys.len() >= limit
        {
            return Err(ClientError::other("key vault is read-only"));
        }
        keys.push(document);
        Ok(())
    }

    async fn delete_one(&self, _namespace: &Namespace, filter: Document) -> Result<u64, ClientError> {
        let mut keys = self.keys.lock().unwrap();
        match keys.iter().position(|key| Self::matches(key, &filter)) {
            Some(index) => {
                keys.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn find_one_and_update(
        &self,
        _namespace: &Namespace,
        filter: Document,
        update: UpdateModifications,
    ) -> Result<Option<RawDocumentBuf>, ClientError> {
        let mut keys = self.keys.lock().unwrap();
        let Some(key) = keys.iter_mut().find(|key| Self::matches(key, &filter)) else {
            return Ok(None);
        };
        let before = raw(key);
        match update {
            UpdateModifications::Document(update) => {
                if let Ok(Bson::String(name)) = update
                    .get_document("$addToSet")
                    .map(|add| add.get("keyAltNames").cloned().unwrap_or(Bson::Null))
                {
                    let mut names = match key.get("keyAltNames") {
                        Some(Bson::Array(names)) => names.clone(),
                        _ => Vec::new(),
                    };
                    if !names.contains(&Bson::String(name.clone())) {
                        names.push(Bson::String(name));
                    }
                    key.insert("keyAltNames", names);
                }
            }
            UpdateModifications::Pipeline(pipeline) => {
                self.pipelines.lock().unwrap().push(pipeline);
            }
        }
        Ok(Some(before))
    }

    async fn bulk_update(
        &self,
        _namespace: &Namespace,
        updates: Vec<UpdateOne>,
    ) -> Result<BulkWriteOutcome, ClientError> {
        let count = updates.len() as u64;
        self.bulk_updates.lock().unwrap().extend(updates);
        Ok(BulkWriteOutcome {
            matched_count: count,
            modified_count: count,
            write_errors: Vec::new(),
        })
    }
}

#[derive(Default)]
pub struct FakeMetadata {
    pub infos: Vec<Document>,
    pub listed: Mutex<Vec<(String, Document)>>,
    pub created: Mutex<Vec<(String, String, Document)>>,
    pub fail_create: AtomicBool,
}

impl FakeMetadata {
    pub fn with_infos(infos: Vec<Document>) -> Self {
        Self {
            infos,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MetadataClient for FakeMetadata {
    async fn list_collections(
        &self,
        db: &str,
        filter: Document,
    ) -> Result<Vec<RawDocumentBuf>, ClientError> {
        self.listed.lock().unwrap().push((db.to_owned(), filter));
        Ok(self.infos.iter().map(raw).collect())
    }

    async fn create_collection(
        &self,
        db: &str,
        name: &str,
        options: Document,
    ) -> Result<(), ClientError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ClientError::other("collection already exists"));
        }
        self.created
            .lock()
            .unwrap()
            .push((db.to_owned(), name.to_owned(), options));
        Ok(())
    }
}

/// Marks commands by wrapping them in `{"marked": <command>}`.
#[derive(Default)]
pub struct FakeMarking {
    pub refusals: AtomicUsize,
    pub calls: AtomicUsize,
    pub pings: AtomicUsize,
    pub reachable: AtomicBool,
}

impl FakeMarking {
    pub fn reachable() -> Self {
        let marking = Self::default();
        marking.reachable.store(true, Ordering::SeqCst);
        marking
    }

    pub fn refusing(times: usize) -> Self {
        let marking = Self::reachable();
        marking.refusals.store(times, Ordering::SeqCst);
        marking
    }
}

#[async_trait]
impl MarkingClient for FakeMarking {
    async fn mark_command(
        &self,
        _db: &str,
        command: RawDocumentBuf,
    ) -> Result<RawDocumentBuf, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(ClientError::connection_refused("connection refused"));
        }
        let command = command.to_document().map_err(ClientError::other)?;
        Ok(raw(&doc! { "marked": command }))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::connection_refused("nothing listening"))
        }
    }
}

// ---------------------------------------------------------------------------
// Helper process

/// Liveness shared between a fake probe and a fake launcher.
#[derive(Default)]
pub struct FakeProbe {
    pub alive: Arc<AtomicBool>,
    pub probes: AtomicUsize,
}

impl FakeProbe {
    pub fn alive() -> Self {
        let probe = Self::default();
        probe.alive.store(true, Ordering::SeqCst);
        probe
    }
}

#[async_trait]
impl LivenessProbe for FakeProbe {
    async fn probe(&self) -> Result<(), ClientError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::connection_refused("nothing listening"))
        }
    }
}

/// Records launches; a launched "process" makes `alive` true unless it is
/// configured to hang or to exit at once.
pub struct FakeLauncher {
    alive: Arc<AtomicBool>,
    pub launches: AtomicUsize,
    pub launched: Mutex<Vec<(String, Vec<String>)>>,
    pub hang: AtomicBool,
    pub exit_immediately: AtomicBool,
    pub shutdowns: AtomicUsize,
    next_pid: AtomicU32,
    children: Mutex<Vec<(watch::Sender<Option<String>>, CancellationToken)>>,
}

impl FakeLauncher {
    pub fn new(probe: &FakeProbe) -> Self {
        Self {
            alive: probe.alive.clone(),
            launches: AtomicUsize::new(0),
            launched: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
            exit_immediately: AtomicBool::new(false),
            shutdowns: AtomicUsize::new(0),
            next_pid: AtomicU32::new(4000),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn terminated(&self) -> usize {
        self.children
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, stop)| stop.is_cancelled())
            .count()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    fn launch(&self, path: &Path, args: &[String]) -> io::Result<HelperProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched
            .lock()
            .unwrap()
            .push((path.display().to_string(), args.to_vec()));

        let (exit_tx, exit_rx) = watch::channel(None);
        if self.exit_immediately.load(Ordering::SeqCst) {
            exit_tx.send_replace(Some("exit status: 1".to_owned()));
        } else if !self.hang.load(Ordering::SeqCst) {
            self.alive.store(true, Ordering::SeqCst);
        }
        let stop = CancellationToken::new();
        self.children
            .lock()
            .unwrap()
            .push((exit_tx, stop.clone()));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(HelperProcess::new(Some(pid), exit_rx, stop))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        for (_, stop) in self.children.lock().unwrap().iter() {
            stop.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// KMS

/// Serves every KMS connection from an in-memory pipe. Each connection
/// reads the request, then writes `served` bytes of a `response_len` byte
/// response. A short response is followed by EOF.
pub struct DuplexKms {
    pub connects: AtomicUsize,
    pub requests: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    response_len: usize,
    served: usize,
}

impl DuplexKms {
    pub fn complete(response_len: usize) -> Arc<Self> {
        Self::partial(response_len, response_len)
    }

    pub fn partial(response_len: usize, served: usize) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
            response_len,
            served,
        })
    }

    pub fn transport(self: &Arc<Self>) -> KmsTransport {
        KmsTransport::new(self.clone())
    }
}

#[async_trait]
impl KmsConnector for DuplexKms {
    async fn connect(
        &self,
        provider: &str,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn KmsStream>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let requests = self.requests.clone();
        let target = format!("{provider}@{host}:{port}");
        let response: Vec<u8> = (0..self.response_len).map(|i| (i % 251) as u8).collect();
        let served = self.served;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap_or(0);
            requests.lock().unwrap().push((target, buf[..n].to_vec()));
            if server.write_all(&response[..served]).await.is_err() {
                return;
            }
            if served == response.len() {
                let mut rest = Vec::new();
                let _ = server.read_to_end(&mut rest).await;
            }
        });
        Ok(Box::new(client))
    }
}

/// KMS endpoints that only answer once `parties` requests have arrived, so
/// requests sent one after another never complete.
pub struct RendezvousKms {
    barrier: Arc<Barrier>,
    response_len: usize,
    pub connects: AtomicUsize,
}

impl RendezvousKms {
    pub fn new(parties: usize, response_len: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Arc::new(Barrier::new(parties)),
            response_len,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn transport(self: &Arc<Self>) -> KmsTransport {
        KmsTransport::new(self.clone())
    }
}

#[async_trait]
impl KmsConnector for RendezvousKms {
    async fn connect(
        &self,
        _provider: &str,
        _host: &str,
        _port: u16,
    ) -> Result<Box<dyn KmsStream>, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let barrier = self.barrier.clone();
        let response = vec![1u8; self.response_len];
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            if server.read(&mut buf).await.unwrap_or(0) == 0 {
                return;
            }
            barrier.wait().await;
            if server.write_all(&response).await.is_ok() {
                let mut rest = Vec::new();
                let _ = server.read_to_end(&mut rest).await;
            }
        });
        Ok(Box::new(client))
    }
}

// ---------------------------------------------------------------------------
// Credentials

/// Token source that counts fetches and never expires its token.
pub struct FixedToken {
    provider: &'static str,
    token: String,
    pub fetches: AtomicUsize,
}

impl FixedToken {
    pub fn new(provider: &'static str, token: &str) -> Arc<Self> {
        Arc::new(Self {
            provider,
            token: token.to_owned(),
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenSource for FixedToken {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn fetch(&self) -> Result<CachedToken, CredentialError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(CachedToken::new(
            Credential::AccessToken(Zeroizing::new(self.token.clone())),
            Expiry::Never,
        ))
    }
}
