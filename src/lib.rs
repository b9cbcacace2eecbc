//! Automatic and explicit field-level encryption driven by an external
//! crypt engine.
//!
//! The engine decides what must be fetched; this crate fetches it:
//! collection metadata, command markings from the local helper process,
//! data keys from the key vault, KMS round trips, and on-demand cloud
//! credentials.

mod app_dir;
pub mod budget;
pub mod client;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod helper;
pub mod logging;
pub mod options;
pub mod session;
pub mod state_machine;
pub(crate) mod utils;

pub use budget::OperationBudget;
pub use engine::{CryptEngine, EngineContext, EngineError, KmsRequest, State};
pub use error::{ClientError, ClientErrorKind, CredentialError, Error, IoAction, Result};
pub use session::{AutoEncrypter, AutoEncrypterClients, ClientEncryption, SessionTransport};
pub use state_machine::StateMachine;
