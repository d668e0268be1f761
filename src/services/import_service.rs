//! Folder import management and replication
//!
//! Live imports are plain rows consulted at read time. A replicated import is
//! materialized instead: creating one also creates a reserved folder below the
//! importing folder plus a hidden live import of it, and every resync copies the
//! source folder's effective secrets into that reserved folder through the
//! mutation applier.

use super::import_resolver::{ImportGraphSource, ImportResolver};
use super::mutation_applier::MutationApplier;
use super::secret_encryption::EnvelopeCodec;
use super::store_source::FolderStore;
use crate::domain::reference::extract_edges;
use crate::domain::{
    reserved_replication_folder_name, Environment, FolderContext, ProjectId, ReplicationSummary,
    SealedCreate, SealedDelete, SealedUpdate, SecretIdentity, SecretImport, SecretImportId,
    SecretOperation, SecretPath, SecretRecord,
};
use crate::errors::{ConflictKind, Result, VaultlineError};
use crate::storage::{
    begin_transaction, commit_transaction, DbPool, EnvironmentRepository, FolderRepository,
    NewSecretImport, SecretImportRepository, SecretRepository,
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A folder that imports the folder being asked about.
#[derive(Debug, Clone, Serialize)]
pub struct ImportingFolder {
    pub environment: String,
    pub secret_path: SecretPath,
    pub import: SecretImport,
}

#[derive(Clone)]
pub struct ImportService {
    applier: MutationApplier,
    codec: Arc<dyn EnvelopeCodec>,
}

impl ImportService {
    pub fn new(applier: MutationApplier, codec: Arc<dyn EnvelopeCodec>) -> Self {
        Self { applier, codec }
    }

    /// Append an import of `source_path` in `source` to `target`.
    #[instrument(skip(self, conn, target, source), fields(target = %describe(target), source = %format!("{}:{}", source.slug, source_path)), name = "create_import")]
    pub async fn create_import(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        source: &Environment,
        source_path: &SecretPath,
        is_replication: bool,
    ) -> Result<SecretImport> {
        if source.id == target.environment.id && source_path == target.path() {
            return Err(VaultlineError::validation_field("A folder cannot import itself", "import_path"));
        }

        let source_folder = FolderRepository::find_by_path(conn, &source.id, source_path)
            .await?
            .ok_or_else(|| VaultlineError::not_found("Folder", format!("{}:{}", source.slug, source_path)))?;
        if source_folder.is_reserved {
            return Err(VaultlineError::validation_field("Reserved folders cannot be imported", "import_path"));
        }

        let existing = SecretImportRepository::list_by_folder(conn, &target.folder.id).await?;
        if existing
            .iter()
            .any(|import| import.import_environment_id == source.id && &import.import_path == source_path)
        {
            return Err(VaultlineError::conflict(
                ConflictKind::AlreadyExists,
                format!("{} already imports {}:{}", describe(target), source.slug, source_path),
            ));
        }

        let back_edges = SecretImportRepository::list_by_folder(conn, &source_folder.id).await?;
        if back_edges.iter().any(|import| {
            import.import_environment_id == target.environment.id && &import.import_path == target.path()
        }) {
            return Err(VaultlineError::validation_field(
                format!("{}:{} already imports {}, which would form a cycle", source.slug, source_path, describe(target)),
                "import_path",
            ));
        }

        let import = SecretImportRepository::create(
            conn,
            &NewSecretImport {
                folder_id: target.folder.id.clone(),
                import_environment_id: source.id.clone(),
                import_path: source_path.clone(),
                is_replication,
                is_reserved: false,
                reserved_for_import_id: None,
            },
        )
        .await?;

        if is_replication {
            let reserved_folder = FolderRepository::create(
                conn,
                &target.folder,
                &reserved_replication_folder_name(import.id.as_str()),
                true,
            )
            .await?;
            SecretImportRepository::create(
                conn,
                &NewSecretImport {
                    folder_id: target.folder.id.clone(),
                    import_environment_id: target.environment.id.clone(),
                    import_path: reserved_folder.path.clone(),
                    is_replication: false,
                    is_reserved: true,
                    reserved_for_import_id: Some(import.id.clone()),
                },
            )
            .await?;

            let summary = self.replicate(conn, target.project_id(), &import).await?;
            info!(import_id = %import.id, created = summary.created, "Seeded replicated import");
        }

        SecretImportRepository::get_by_id(conn, &import.id)
            .await?
            .ok_or_else(|| VaultlineError::internal(format!("Import '{}' vanished after insert", import.id)))
    }

    /// Move an import of `target` to `position`, shifting its neighbours.
    #[instrument(skip(self, conn, target), fields(target = %describe(target), import_id = %import_id, position), name = "update_import_position")]
    pub async fn update_position(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        import_id: &SecretImportId,
        position: i64,
    ) -> Result<SecretImport> {
        let import = load_import(conn, target, import_id).await?;
        let count = SecretImportRepository::list_by_folder(conn, &target.folder.id).await?.len() as i64;
        if position < 0 || position >= count {
            return Err(VaultlineError::validation_field(
                format!("Position must be between 0 and {}", count - 1),
                "position",
            ));
        }

        if position != import.position {
            SecretImportRepository::set_position(conn, &import, position).await?;
        }
        load_import(conn, target, import_id).await
    }

    /// Delete an import. Deleting a replication also removes its reserved folder.
    #[instrument(skip(self, conn, target), fields(target = %describe(target), import_id = %import_id), name = "delete_import")]
    pub async fn delete_import(
        &self,
        conn: &mut SqliteConnection,
        target: &FolderContext,
        import_id: &SecretImportId,
    ) -> Result<SecretImport> {
        let import = load_import(conn, target, import_id).await?;
        if import.is_reserved {
            return Err(VaultlineError::validation_field(
                "Reserved imports are removed with their replication",
                "import_id",
            ));
        }

        if import.is_replication {
            if let Some(reserved) = SecretImportRepository::find_reserved_for(conn, &import.id).await? {
                SecretImportRepository::delete(conn, &reserved).await?;
                if let Some(folder) =
                    FolderRepository::find_by_path(conn, &target.environment.id, &reserved.import_path).await?
                {
                    FolderRepository::delete(conn, &folder.id).await?;
                }
            }
        }

        // positions may have shifted under the reserved import's removal
        let current = load_import(conn, target, import_id).await?;
        SecretImportRepository::delete(conn, &current).await?;
        info!(import_id = %import_id, "Deleted secret import");
        Ok(current)
    }

    /// Visible imports of `target` in position order.
    pub async fn list_imports(&self, conn: &mut SqliteConnection, target: &FolderContext) -> Result<Vec<SecretImport>> {
        let imports = SecretImportRepository::list_by_folder(conn, &target.folder.id).await?;
        Ok(imports.into_iter().filter(|import| !import.is_reserved).collect())
    }

    /// Folders whose visible imports point at `environment:path`.
    pub async fn get_folder_imported_by(
        &self,
        conn: &mut SqliteConnection,
        environment: &Environment,
        path: &SecretPath,
    ) -> Result<Vec<ImportingFolder>> {
        let imports = SecretImportRepository::list_by_target(conn, &environment.id, path).await?;
        let mut slugs: HashMap<_, String> = HashMap::new();
        let mut importers = Vec::new();

        for import in imports.into_iter().filter(|import| !import.is_reserved) {
            let Some(folder) = FolderRepository::get_by_id(conn, &import.folder_id).await? else {
                continue;
            };
            let slug = match slugs.get(&folder.environment_id) {
                Some(slug) => slug.clone(),
                None => {
                    let Some(env) = EnvironmentRepository::get_by_id(conn, &folder.environment_id).await? else {
                        continue;
                    };
                    slugs.insert(folder.environment_id.clone(), env.slug.clone());
                    env.slug
                }
            };
            importers.push(ImportingFolder { environment: slug, secret_path: folder.path, import });
        }
        Ok(importers)
    }

    /// Copy the source of a replicated import into its reserved folder.
    #[instrument(skip(self, conn), fields(project_id = %project_id, import_id = %import_id), name = "resync_replicated_import")]
    pub async fn resync_replicated_import(
        &self,
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        import_id: &SecretImportId,
    ) -> Result<ReplicationSummary> {
        let import = SecretImportRepository::get_by_id(conn, import_id)
            .await?
            .ok_or_else(|| VaultlineError::not_found("SecretImport", import_id.as_str()))?;
        if !import.is_replication {
            return Err(VaultlineError::validation_field("Only replicated imports can be resynced", "import_id"));
        }
        self.replicate(conn, project_id, &import).await
    }

    /// Resync every replicated import of a project, each in its own transaction.
    /// Failures are recorded on the import and do not stop the sweep.
    #[instrument(skip(self, pool), fields(project_id = %project_id), name = "resync_all_replications")]
    pub async fn resync_all_replications(
        &self,
        pool: &DbPool,
        project_id: &ProjectId,
    ) -> Result<Vec<Result<ReplicationSummary>>> {
        let replications = {
            let mut conn = pool.acquire().await?;
            SecretImportRepository::list_replications(&mut conn, project_id).await?
        };

        let mut results = Vec::with_capacity(replications.len());
        for import in replications {
            let mut tx = begin_transaction(pool).await?;
            let result = match self.replicate(&mut tx, project_id, &import).await {
                Ok(summary) => commit_transaction(tx).await.map(|_| summary),
                Err(e) => {
                    drop(tx);
                    warn!(import_id = %import.id, error = %e, "Replication failed");
                    let mut conn = pool.acquire().await?;
                    SecretImportRepository::record_replication(&mut conn, &import.id, None, Some(&e.to_string()))
                        .await?;
                    Err(e)
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn replicate(
        &self,
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        import: &SecretImport,
    ) -> Result<ReplicationSummary> {
        let reserved = SecretImportRepository::find_reserved_for(conn, &import.id)
            .await?
            .ok_or_else(|| VaultlineError::internal(format!("Replication '{}' has no reserved import", import.id)))?;

        let (destination, source_secrets) = {
            let mut store = FolderStore::new(&mut *conn, project_id.clone());
            let destination = store
                .folder(&reserved.import_environment_id, &reserved.import_path)
                .await?
                .ok_or_else(|| VaultlineError::not_found("Folder", reserved.import_path.to_string()))?;
            let source = store
                .folder(&import.import_environment_id, &import.import_path)
                .await?
                .ok_or_else(|| {
                    VaultlineError::not_found(
                        "Folder",
                        format!("{}:{}", import.import_environment_slug, import.import_path),
                    )
                })?;
            let effective = ImportResolver::new().effective_shared(&mut store, &source).await?;
            let secrets: Vec<SecretRecord> = effective.into_values().map(|secret| secret.record).collect();
            (destination, secrets)
        };

        let existing: HashMap<String, SecretRecord> = SecretRepository::list_shared(conn, &destination.folder.id)
            .await?
            .into_iter()
            .map(|secret| (secret.key.clone(), secret))
            .collect();

        let mut summary = ReplicationSummary { import_id: Some(import.id.clone()), ..Default::default() };
        let mut operations = Vec::new();
        for source in &source_secrets {
            let plaintext = self.codec.open_string(&source.value, project_id)?;
            let references = extract_edges(&plaintext)?;
            match existing.get(&source.key) {
                None => {
                    summary.created += 1;
                    operations.push(SecretOperation::Create(SealedCreate {
                        identity: SecretIdentity::shared(source.key.clone()),
                        key_blind_index: source.key_blind_index.clone(),
                        value: source.value.clone(),
                        comment: source.comment.clone(),
                        skip_multiline_encoding: source.skip_multiline_encoding,
                        tags: source.tags.clone(),
                        metadata: source.metadata.clone(),
                        references,
                    }));
                }
                Some(current) => {
                    if self.codec.open_string(&current.value, project_id)? == plaintext {
                        continue;
                    }
                    summary.updated += 1;
                    operations.push(SecretOperation::Update(SealedUpdate {
                        identity: SecretIdentity::shared(source.key.clone()),
                        expected_version: Some(current.version),
                        new_key: None,
                        new_key_blind_index: None,
                        value: Some(source.value.clone()),
                        comment: source.comment.clone(),
                        skip_multiline_encoding: Some(source.skip_multiline_encoding),
                        tags: Some(source.tags.clone()),
                        metadata: Some(source.metadata.clone()),
                        references: Some(references),
                    }));
                }
            }
        }

        let kept: std::collections::HashSet<&str> = source_secrets.iter().map(|s| s.key.as_str()).collect();
        for (key, current) in &existing {
            if !kept.contains(key.as_str()) {
                summary.deleted += 1;
                operations.push(SecretOperation::Delete(SealedDelete {
                    identity: SecretIdentity::shared(key.clone()),
                    expected_version: Some(current.version),
                }));
            }
        }

        if !operations.is_empty() {
            self.applier.apply(conn, &destination, None, &operations).await?;
        }
        SecretImportRepository::record_replication(conn, &import.id, Some(Utc::now()), None).await?;

        info!(
            import_id = %import.id,
            created = summary.created,
            updated = summary.updated,
            deleted = summary.deleted,
            "Replicated import"
        );
        Ok(summary)
    }
}

async fn load_import(
    conn: &mut SqliteConnection,
    target: &FolderContext,
    import_id: &SecretImportId,
) -> Result<SecretImport> {
    SecretImportRepository::get_by_id(conn, import_id)
        .await?
        .filter(|import| import.folder_id == target.folder.id)
        .ok_or_else(|| VaultlineError::not_found("SecretImport", import_id.as_str()))
}

fn describe(context: &FolderContext) -> String {
    format!("{}:{}", context.environment.slug, context.folder.path)
}
