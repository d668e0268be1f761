//! Database-backed graph sources
//!
//! [`FolderStore`] reads the folder graph of one project through a single
//! connection. [`StoreSource`] layers import resolution and decryption on top of
//! it to answer reference lookups. Both cache what they read for the lifetime of
//! one engine call.

use super::import_resolver::{ImportGraphSource, ImportResolver};
use super::reference_resolver::{LocatedValue, ReferenceSource};
use super::secret_encryption::EnvelopeCodec;
use crate::domain::{
    Environment, EnvironmentId, FolderContext, FolderId, ProjectId, SecretImport, SecretLocator,
    SecretPath, SecretRecord,
};
use crate::errors::Result;
use crate::storage::{
    EnvironmentRepository, FolderRepository, SecretImportRepository, SecretRepository,
};
use async_trait::async_trait;
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Folder graph of one project, read through `conn`.
pub struct FolderStore<'c> {
    conn: &'c mut SqliteConnection,
    project_id: ProjectId,
    environments: HashMap<EnvironmentId, Option<Environment>>,
    slugs: HashMap<String, Option<EnvironmentId>>,
    folders: HashMap<(EnvironmentId, SecretPath), Option<FolderContext>>,
}

impl<'c> FolderStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection, project_id: ProjectId) -> Self {
        Self {
            conn,
            project_id,
            environments: HashMap::new(),
            slugs: HashMap::new(),
            folders: HashMap::new(),
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }

    /// Environment of this project by id. Environments of other projects are invisible.
    pub async fn environment(&mut self, id: &EnvironmentId) -> Result<Option<Environment>> {
        if let Some(cached) = self.environments.get(id) {
            return Ok(cached.clone());
        }
        let environment = EnvironmentRepository::get_by_id(self.conn, id)
            .await?
            .filter(|env| env.project_id == self.project_id);
        self.environments.insert(id.clone(), environment.clone());
        Ok(environment)
    }

    pub async fn environment_by_slug(&mut self, slug: &str) -> Result<Option<Environment>> {
        if let Some(cached) = self.slugs.get(slug) {
            return match cached.clone() {
                Some(id) => self.environment(&id).await,
                None => Ok(None),
            };
        }
        let environment = EnvironmentRepository::find_by_slug(self.conn, &self.project_id, slug).await?;
        self.slugs.insert(slug.to_string(), environment.as_ref().map(|env| env.id.clone()));
        if let Some(env) = &environment {
            self.environments.insert(env.id.clone(), Some(env.clone()));
        }
        Ok(environment)
    }
}

#[async_trait]
impl ImportGraphSource for FolderStore<'_> {
    async fn folder(
        &mut self,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Option<FolderContext>> {
        let cache_key = (environment_id.clone(), path.clone());
        if let Some(cached) = self.folders.get(&cache_key) {
            return Ok(cached.clone());
        }

        let context = match self.environment(environment_id).await? {
            Some(environment) => FolderRepository::find_by_path(self.conn, environment_id, path)
                .await?
                .map(|folder| FolderContext { environment, folder }),
            None => None,
        };
        self.folders.insert(cache_key, context.clone());
        Ok(context)
    }

    async fn shared_secrets(&mut self, folder_id: &FolderId) -> Result<Vec<SecretRecord>> {
        SecretRepository::list_shared(self.conn, folder_id).await
    }

    async fn personal_secrets(&mut self, folder_id: &FolderId, owner: &str) -> Result<Vec<SecretRecord>> {
        SecretRepository::list_personal(self.conn, folder_id, owner).await
    }

    async fn imports(&mut self, folder_id: &FolderId) -> Result<Vec<SecretImport>> {
        SecretImportRepository::list_by_folder(self.conn, folder_id).await
    }

    async fn descendants(&mut self, context: &FolderContext) -> Result<Vec<FolderContext>> {
        let folders =
            FolderRepository::list_descendants(self.conn, &context.environment.id, &context.folder.path)
                .await?;
        Ok(folders
            .into_iter()
            .map(|folder| FolderContext { environment: context.environment.clone(), folder })
            .collect())
    }
}

/// Answers reference lookups from effective shared sets, decrypting on demand.
pub struct StoreSource<'c> {
    pub store: FolderStore<'c>,
    pub imports: ImportResolver,
    codec: &'c dyn EnvelopeCodec,
}

impl<'c> StoreSource<'c> {
    pub fn new(conn: &'c mut SqliteConnection, project_id: ProjectId, codec: &'c dyn EnvelopeCodec) -> Self {
        Self { store: FolderStore::new(conn, project_id), imports: ImportResolver::new(), codec }
    }

    pub fn codec(&self) -> &dyn EnvelopeCodec {
        self.codec
    }
}

#[async_trait]
impl ReferenceSource for StoreSource<'_> {
    async fn lookup(&mut self, locator: &SecretLocator) -> Result<Option<LocatedValue>> {
        let Some(environment) = self.store.environment_by_slug(&locator.environment).await? else {
            return Ok(None);
        };
        let Some(context) = self.store.folder(&environment.id, &locator.path).await? else {
            return Ok(None);
        };

        let set = self.imports.effective_shared(&mut self.store, &context).await?;
        let Some(secret) = set.get(&locator.key) else {
            return Ok(None);
        };

        let value = self.codec.open_string(&secret.record.value, self.store.project_id())?;
        Ok(Some(LocatedValue {
            locator: SecretLocator::new(
                secret.environment.clone(),
                secret.secret_path.clone(),
                secret.record.key.clone(),
            ),
            value,
        }))
    }
}
