use std::sync::Arc;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document, RawDocumentBuf, doc};

use super::{SessionTransport, to_bytes, to_document};
use crate::budget::OperationBudget;
use crate::client::{
    BulkWriteOutcome, KeyVaultClient, MetadataClient, UpdateModifications, UpdateOne,
};
use crate::engine::{CryptEngine, EngineContext, EngineError, State};
use crate::error::{Error, IoAction, Result};
use crate::options::{
    DataKeyOptions, EncryptOptions, EncryptionOptions, MasterKey, RewrapManyDataKeyOptions,
};
use crate::state_machine::StateMachine;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewrapManyDataKeyResult {
    /// `None` when no key matched the filter.
    pub bulk_write_result: Option<BulkWriteOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted_count: u64,
}

#[derive(Debug, Clone)]
pub struct CreateEncryptedCollectionOptions {
    /// `encryptedFields`; entries with `keyId: null` get a new data key.
    pub encrypted_fields: Document,
    pub provider: String,
    pub master_key: Option<MasterKey>,
    /// Other `create` options, passed through.
    pub collection_options: Document,
}

/// Explicit encryption and key management.
pub struct ClientEncryption {
    options: EncryptionOptions,
    engine: Arc<dyn CryptEngine>,
    key_vault: Arc<dyn KeyVaultClient>,
    metadata: Option<Arc<dyn MetadataClient>>,
    state_machine: StateMachine,
}

impl ClientEncryption {
    pub fn new(
        options: EncryptionOptions,
        engine: Arc<dyn CryptEngine>,
        key_vault: Arc<dyn KeyVaultClient>,
        metadata: Option<Arc<dyn MetadataClient>>,
    ) -> Result<Self> {
        options.validate()?;
        let transport = SessionTransport::from_options(&options)?;
        Self::with_transport(options, engine, key_vault, metadata, transport)
    }

    pub fn with_transport(
        options: EncryptionOptions,
        engine: Arc<dyn CryptEngine>,
        key_vault: Arc<dyn KeyVaultClient>,
        metadata: Option<Arc<dyn MetadataClient>>,
        transport: SessionTransport,
    ) -> Result<Self> {
        options.validate()?;
        engine
            .set_key_expiration(options.key_expiration)
            .map_err(|e| Error::engine(State::Error, e))?;
        let mut state_machine = StateMachine::new(
            key_vault.clone(),
            options.key_vault_namespace.clone(),
            transport.credentials,
            transport.kms,
        );
        if let Some(metadata) = &metadata {
            state_machine = state_machine.with_metadata_client(metadata.clone());
        }
        Ok(Self {
            options,
            engine,
            key_vault,
            metadata,
            state_machine,
        })
    }

    async fn run(
        &self,
        context: std::result::Result<Box<dyn EngineContext>, EngineError>,
        budget: &OperationBudget,
    ) -> Result<Document> {
        let context = context.map_err(|e| Error::engine(State::Error, e))?;
        let output = self.state_machine.execute(context, budget).await?;
        to_document(&output)
    }

    /// Create a data key wrapped by `provider` and store it in the key vault.
    /// Returns the new key's UUID.
    pub async fn create_data_key(
        &self,
        provider: &str,
        options: DataKeyOptions,
        budget: &OperationBudget,
    ) -> Result<Binary> {
        options.validate(provider)?;
        self.options.kms_providers.ensure_configured(provider)?;

        let key = self
            .run(self.engine.data_key_context(provider, &options), budget)
            .await?;
        let id = match key.get("_id") {
            Some(Bson::Binary(id)) if id.subtype == BinarySubtype::Uuid => id.clone(),
            _ => return Err(Error::Bson("data key has no UUID _id".into())),
        };

        budget
            .run(IoAction::KeyVaultWrite, async {
                self.key_vault
                    .insert_one(&self.options.key_vault_namespace, key)
                    .await
                    .map_err(|e| Error::io(IoAction::KeyVaultWrite, e))
            })
            .await?;
        tracing::debug!(provider, "created data key");
        Ok(id)
    }

    /// Re-encrypt the data keys matching `filter`, optionally under a new
    /// provider or master key.
    pub async fn rewrap_many_data_key(
        &self,
        filter: Document,
        options: RewrapManyDataKeyOptions,
        budget: &OperationBudget,
    ) -> Result<RewrapManyDataKeyResult> {
        options.validate()?;
        if let Some(provider) = &options.provider {
            self.options.kms_providers.ensure_configured(provider)?;
        }
        let filter = to_bytes(&filter)?;
        let rewrapped = self
            .run(
                self.engine.rewrap_many_data_key_context(
                    &filter,
                    options.provider.as_deref(),
                    options.master_key.as_ref(),
                ),
                budget,
            )
            .await?;

        let keys: &[Bson] = match rewrapped.get("v") {
            Some(Bson::Array(keys)) => keys,
            _ => &[],
        };
        if keys.is_empty() {
            return Ok(RewrapManyDataKeyResult::default());
        }
        let updates = keys
            .iter()
            .map(rewrap_update)
            .collect::<Result<Vec<_>>>()?;

        let outcome = budget
            .run(IoAction::KeyVaultWrite, async {
                self.key_vault
                    .bulk_update(&self.options.key_vault_namespace, updates)
                    .await
                    .map_err(|e| Error::io(IoAction::KeyVaultWrite, e))
            })
            .await?;
        Ok(RewrapManyDataKeyResult {
            bulk_write_result: Some(outcome),
        })
    }

    pub async fn delete_key(&self, id: &Binary, budget: &OperationBudget) -> Result<DeleteOutcome> {
        let deleted_count = budget
            .run(IoAction::KeyVaultWrite, async {
                self.key_vault
                    .delete_one(&self.options.key_vault_namespace, doc! { "_id": id.clone() })
                    .await
                    .map_err(|e| Error::io(IoAction::KeyVaultWrite, e))
            })
            .await?;
        Ok(DeleteOutcome { deleted_count })
    }

    pub async fn get_key(
        &self,
        id: &Binary,
        budget: &OperationBudget,
    ) -> Result<Option<RawDocumentBuf>> {
        let mut keys = self.find_keys(doc! { "_id": id.clone() }, budget).await?;
        Ok((!keys.is_empty()).then(|| keys.swap_remove(0)))
    }

    pub async fn get_keys(&self, budget: &OperationBudget) -> Result<Vec<RawDocumentBuf>> {
        self.find_keys(Document::new(), budget).await
    }

    pub async fn get_key_by_alt_name(
        &self,
        key_alt_name: &str,
        budget: &OperationBudget,
    ) -> Result<Option<RawDocumentBuf>> {
        let mut keys = self
            .find_keys(doc! { "keyAltNames": key_alt_name }, budget)
            .await?;
        Ok((!keys.is_empty()).then(|| keys.swap_remove(0)))
    }

    async fn find_keys(
        &self,
        filter: Document,
        budget: &OperationBudget,
    ) -> Result<Vec<RawDocumentBuf>> {
        budget
            .run(IoAction::Keys, async {
                self.key_vault
                    .find(&self.options.key_vault_namespace, filter)
                    .await
                    .map_err(|e| Error::io(IoAction::Keys, e))
            })
            .await
    }

    /// Add `key_alt_name` to the key. Returns the key as it was before.
    pub async fn add_key_alt_name(
        &self,
        id: &Binary,
        key_alt_name: &str,
        budget: &OperationBudget,
    ) -> Result<Option<RawDocumentBuf>> {
        let update = doc! { "$addToSet": { "keyAltNames": key_alt_name } };
        self.update_key(id, UpdateModifications::Document(update), budget)
            .await
    }

    /// Remove `key_alt_name` from the key, dropping the field when it becomes
    /// empty. Returns the key as it was before.
    pub async fn remove_key_alt_name(
        &self,
        id: &Binary,
        key_alt_name: &str,
        budget: &OperationBudget,
    ) -> Result<Option<RawDocumentBuf>> {
        let pipeline = vec![doc! {
            "$set": {
                "keyAltNames": {
                    "$cond": [
                        { "$eq": ["$keyAltNames", [key_alt_name]] },
                        "$$REMOVE",
                        {
                            "$filter": {
                                "input": "$keyAltNames",
                                "cond": { "$ne": ["$$this", key_alt_name] },
                            }
                        },
                    ]
                }
            }
        }];
        self.update_key(id, UpdateModifications::Pipeline(pipeline), budget)
            .await
    }

    async fn update_key(
        &self,
        id: &Binary,
        update: UpdateModifications,
        budget: &OperationBudget,
    ) -> Result<Option<RawDocumentBuf>> {
        budget
            .run(IoAction::KeyVaultWrite, async {
                self.key_vault
                    .find_one_and_update(
                        &self.options.key_vault_namespace,
                        doc! { "_id": id.clone() },
                        update,
                    )
                    .await
                    .map_err(|e| Error::io(IoAction::KeyVaultWrite, e))
            })
            .await
    }

    /// Encrypt a single value.
    pub async fn encrypt(
        &self,
        value: Bson,
        options: &EncryptOptions,
        budget: &OperationBudget,
    ) -> Result<Binary> {
        options.validate(false)?;
        let wrapped = to_bytes(&doc! { "v": value })?;
        let output = self
            .run(
                self.engine.explicit_encryption_context(&wrapped, options),
                budget,
            )
            .await?;
        match output.get("v") {
            Some(Bson::Binary(ciphertext)) => Ok(ciphertext.clone()),
            _ => Err(Error::Bson("encryption result has no binary value".into())),
        }
    }

    /// Encrypt a range query expression such as `{"$and": [...]}`.
    pub async fn encrypt_expression(
        &self,
        expression: Document,
        options: &EncryptOptions,
        budget: &OperationBudget,
    ) -> Result<Document> {
        options.validate(true)?;
        let wrapped = to_bytes(&doc! { "v": expression })?;
        let output = self
            .run(
                self.engine
                    .explicit_encryption_expression_context(&wrapped, options),
                budget,
            )
            .await?;
        match output.get("v") {
            Some(Bson::Document(encrypted)) => Ok(encrypted.clone()),
            _ => Err(Error::Bson(
                "expression encryption result has no document value".into(),
            )),
        }
    }

    pub async fn decrypt(&self, value: &Binary, budget: &OperationBudget) -> Result<Bson> {
        if value.subtype != BinarySubtype::Encrypted {
            return Err(Error::configuration(
                "only encrypted binary values (subtype 6) can be decrypted",
            ));
        }
        let wrapped = to_bytes(&doc! { "v": value.clone() })?;
        let mut output = self
            .run(self.engine.explicit_decryption_context(&wrapped), budget)
            .await?;
        output
            .remove("v")
            .ok_or_else(|| Error::Bson("decryption result has no value".into()))
    }

    /// Create data keys for every field in `encryptedFields` that asks for
    /// one, then create the collection. On failure the error carries the
    /// fields with the keys created so far.
    pub async fn create_encrypted_collection(
        &self,
        db: &str,
        name: &str,
        options: CreateEncryptedCollectionOptions,
        budget: &OperationBudget,
    ) -> Result<Document> {
        let metadata = self.metadata.as_ref().ok_or_else(|| {
            Error::configuration("creating a collection requires a metadata client")
        })?;
        let CreateEncryptedCollectionOptions {
            mut encrypted_fields,
            provider,
            master_key,
            mut collection_options,
        } = options;
        let mut fields = match encrypted_fields.get("fields") {
            Some(Bson::Array(fields)) => fields.clone(),
            _ => {
                return Err(Error::configuration(
                    "encryptedFields must contain a fields array",
                ));
            }
        };

        for index in 0..fields.len() {
            let needs_key = matches!(
                &fields[index],
                Bson::Document(field) if matches!(field.get("keyId"), Some(Bson::Null))
            );
            if !needs_key {
                continue;
            }
            let key_options = DataKeyOptions {
                master_key: master_key.clone(),
                ..Default::default()
            };
            match self.create_data_key(&provider, key_options, budget).await {
                Ok(id) => {
                    if let Bson::Document(field) = &mut fields[index] {
                        field.insert("keyId", id);
                    }
                }
                Err(source) => {
                    encrypted_fields.insert("fields", fields);
                    return Err(Error::CreateEncryptedCollection {
                        encrypted_fields,
                        source: Box::new(source),
                    });
                }
            }
        }
        encrypted_fields.insert("fields", fields);

        collection_options.insert("encryptedFields", encrypted_fields.clone());
        let created = budget
            .run(IoAction::CreateCollection, async {
                metadata
                    .create_collection(db, name, collection_options)
                    .await
                    .map_err(|e| Error::io(IoAction::CreateCollection, e))
            })
            .await;
        match created {
            Ok(()) => Ok(encrypted_fields),
            Err(source) => Err(Error::CreateEncryptedCollection {
                encrypted_fields,
                source: Box::new(source),
            }),
        }
    }
}

impl std::fmt::Debug for ClientEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEncryption")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn rewrap_update(key: &Bson) -> Result<UpdateOne> {
    let Bson::Document(key) = key else {
        return Err(Error::Bson("rewrapped key is not a document".into()));
    };
    let field = |name: &str| {
        key.get(name)
            .cloned()
            .ok_or_else(|| Error::Bson(format!("rewrapped key has no {name}")))
    };
    Ok(UpdateOne {
        filter: doc! { "_id": field("_id")? },
        update: doc! {
            "$set": {
                "masterKey": field("masterKey")?,
                "keyMaterial": field("keyMaterial")?,
            },
            "$currentDate": { "updateDate": true },
        },
    })
}
