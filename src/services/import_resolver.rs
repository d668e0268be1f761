//! Effective secret sets
//!
//! A folder's effective set is its own shared secrets layered over the effective
//! sets of the folders it imports. Imports are merged in ascending `position`, so
//! a later import overrides an earlier one on the same key, and local secrets
//! override every import. Replicated imports never take part; their reserved live
//! import does.
//!
//! Expansion is a post-order walk over an explicit stack. A folder that is
//! revisited while it is still being expanded is an import cycle.

use crate::domain::{
    EnvironmentId, FolderContext, FolderId, SecretImport, SecretPath, SecretRecord,
};
use crate::errors::{GraphErrorKind, Result, VaultlineError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::iter;
use tracing::{debug, instrument};

/// Read access to the folder graph.
#[async_trait]
pub trait ImportGraphSource: Send {
    async fn folder(
        &mut self,
        environment_id: &EnvironmentId,
        path: &SecretPath,
    ) -> Result<Option<FolderContext>>;

    async fn shared_secrets(&mut self, folder_id: &FolderId) -> Result<Vec<SecretRecord>>;

    async fn personal_secrets(&mut self, folder_id: &FolderId, owner: &str) -> Result<Vec<SecretRecord>>;

    /// Imports of a folder in position order.
    async fn imports(&mut self, folder_id: &FolderId) -> Result<Vec<SecretImport>>;

    /// Non-reserved folders strictly below `context`, ordered by path.
    async fn descendants(&mut self, context: &FolderContext) -> Result<Vec<FolderContext>>;
}

/// A secret in an effective set, with the location it was defined at.
#[derive(Debug, Clone)]
pub struct EffectiveSecret {
    pub record: SecretRecord,
    pub environment: String,
    pub secret_path: SecretPath,
}

impl EffectiveSecret {
    fn local(record: SecretRecord, context: &FolderContext) -> Self {
        Self {
            record,
            environment: context.environment.slug.clone(),
            secret_path: context.folder.path.clone(),
        }
    }

    /// Whether the secret was inherited rather than defined in `folder_id`.
    pub fn is_imported_into(&self, folder_id: &FolderId) -> bool {
        &self.record.folder_id != folder_id
    }
}

pub type EffectiveSet = BTreeMap<String, EffectiveSecret>;

/// Effective secrets of one folder as read by one viewer.
#[derive(Debug, Clone)]
pub struct ResolvedFolder {
    pub context: FolderContext,
    pub secrets: Vec<EffectiveSecret>,
}

struct Frame {
    context: FolderContext,
    imports: Vec<SecretImport>,
    next: usize,
    merged: Vec<FolderId>,
}

/// Resolves and memoizes effective sets for the duration of one read.
#[derive(Default)]
pub struct ImportResolver {
    memo: HashMap<FolderId, EffectiveSet>,
}

impl ImportResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared effective set of `context`, keyed by secret key.
    #[instrument(skip(self, source, context), fields(environment = %context.environment.slug, path = %context.folder.path), name = "resolve_effective_shared")]
    pub async fn effective_shared<S>(&mut self, source: &mut S, context: &FolderContext) -> Result<EffectiveSet>
    where
        S: ImportGraphSource + ?Sized,
    {
        if let Some(set) = self.memo.get(&context.folder.id) {
            return Ok(set.clone());
        }

        let mut on_stack: HashSet<FolderId> = HashSet::from([context.folder.id.clone()]);
        let mut stack = vec![Self::frame(source, context.clone()).await?];

        while let Some(frame) = stack.last_mut() {
            if frame.next == frame.imports.len() {
                let Some(done) = stack.pop() else { break };
                on_stack.remove(&done.context.folder.id);

                let mut set = EffectiveSet::new();
                for imported in &done.merged {
                    if let Some(imported_set) = self.memo.get(imported) {
                        set.extend(imported_set.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
                for record in source.shared_secrets(&done.context.folder.id).await? {
                    set.insert(record.key.clone(), EffectiveSecret::local(record, &done.context));
                }

                debug!(
                    environment = %done.context.environment.slug,
                    path = %done.context.folder.path,
                    secrets = set.len(),
                    imports = done.merged.len(),
                    "Resolved folder imports"
                );
                self.memo.insert(done.context.folder.id.clone(), set);
                continue;
            }

            let import = frame.imports[frame.next].clone();
            frame.next += 1;

            let Some(target) = source.folder(&import.import_environment_id, &import.import_path).await? else {
                debug!(import_id = %import.id, import_path = %import.import_path, "Skipping import of missing folder");
                continue;
            };

            if on_stack.contains(&target.folder.id) {
                let chain: Vec<String> = stack
                    .iter()
                    .skip_while(|f| f.context.folder.id != target.folder.id)
                    .map(|f| describe(&f.context))
                    .chain(iter::once(describe(&target)))
                    .collect();
                return Err(VaultlineError::graph(
                    GraphErrorKind::ImportCycle,
                    format!("Import cycle detected: {}", chain.join(" -> ")),
                    chain,
                ));
            }

            if let Some(frame) = stack.last_mut() {
                frame.merged.push(target.folder.id.clone());
            }
            if self.memo.contains_key(&target.folder.id) {
                continue;
            }

            on_stack.insert(target.folder.id.clone());
            stack.push(Self::frame(source, target).await?);
        }

        self.memo
            .get(&context.folder.id)
            .cloned()
            .ok_or_else(|| VaultlineError::internal("Import walk ended without a result"))
    }

    /// Effective secrets of `context` as `viewer` sees them, optionally with every
    /// descendant folder. Secrets are ordered by key within each folder.
    pub async fn resolve<S>(
        &mut self,
        source: &mut S,
        context: &FolderContext,
        viewer: Option<&str>,
        recursive: bool,
    ) -> Result<Vec<ResolvedFolder>>
    where
        S: ImportGraphSource + ?Sized,
    {
        let mut folders = vec![context.clone()];
        if recursive {
            folders.extend(source.descendants(context).await?);
        }

        let mut resolved = Vec::with_capacity(folders.len());
        for folder in folders {
            let mut set = self.effective_shared(source, &folder).await?;
            if let Some(owner) = viewer {
                for record in source.personal_secrets(&folder.folder.id, owner).await? {
                    set.insert(record.key.clone(), EffectiveSecret::local(record, &folder));
                }
            }
            resolved.push(ResolvedFolder { context: folder, secrets: set.into_values().collect() });
        }

        Ok(resolved)
    }

    async fn frame<S>(source: &mut S, context: FolderContext) -> Result<Frame>
    where
        S: ImportGraphSource + ?Sized,
    {
        let imports = source
            .imports(&context.folder.id)
            .await?
            .into_iter()
            .filter(SecretImport::is_live)
            .collect();
        Ok(Frame { context, imports, next: 0, merged: Vec::new() })
    }
}

fn describe(context: &FolderContext) -> String {
    format!("{}:{}", context.environment.slug, context.folder.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Envelope, Environment, Folder, ProjectId, SecretId, SecretImportId, SecretType,
    };
    use chrono::Utc;

    /// In-memory folder graph keyed by `(environment slug, path)`.
    #[derive(Default)]
    struct MemoryGraph {
        project_id: ProjectId,
        environments: HashMap<String, Environment>,
        folders: Vec<FolderContext>,
        secrets: Vec<SecretRecord>,
        imports: Vec<SecretImport>,
    }

    impl MemoryGraph {
        fn folder_context(&mut self, env: &str, path: &str) -> FolderContext {
            let path = SecretPath::parse(path).unwrap();
            if let Some(existing) = self.folders.iter().find(|f| f.environment.slug == env && f.folder.path == path) {
                return existing.clone();
            }
            let project_id = self.project_id.clone();
            let environment = self
                .environments
                .entry(env.to_string())
                .or_insert_with(|| Environment {
                    id: EnvironmentId::new(),
                    project_id,
                    slug: env.to_string(),
                    name: env.to_string(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .clone();
            let context = FolderContext {
                folder: Folder {
                    id: FolderId::new(),
                    environment_id: environment.id.clone(),
                    parent_id: None,
                    name: path.name().unwrap_or("root").to_string(),
                    path,
                    is_reserved: false,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                environment,
            };
            self.folders.push(context.clone());
            context
        }

        fn secret(&mut self, env: &str, path: &str, key: &str, value: &str) {
            self.put(env, path, key, value, None);
        }

        fn personal(&mut self, env: &str, path: &str, key: &str, value: &str, owner: &str) {
            self.put(env, path, key, value, Some(owner));
        }

        fn put(&mut self, env: &str, path: &str, key: &str, value: &str, owner: Option<&str>) {
            let folder = self.folder_context(env, path);
            self.secrets.push(SecretRecord {
                id: SecretId::new(),
                folder_id: folder.folder.id,
                key: key.to_string(),
                key_blind_index: key.to_lowercase(),
                secret_type: if owner.is_some() { SecretType::Personal } else { SecretType::Shared },
                owner_actor_id: owner.map(str::to_string),
                version: 1,
                value: Envelope {
                    key_version: "plain".into(),
                    nonce: [0u8; 12],
                    ciphertext: value.as_bytes().to_vec(),
                },
                comment: None,
                skip_multiline_encoding: false,
                tags: vec![],
                metadata: vec![],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }

        fn import(&mut self, env: &str, path: &str, from_env: &str, from_path: &str) {
            self.add_import(env, path, from_env, from_path, false);
        }

        fn add_import(
            &mut self,
            env: &str,
            path: &str,
            from_env: &str,
            from_path: &str,
            is_replication: bool,
        ) {
            let folder = self.folder_context(env, path);
            let source = self.folder_context(from_env, from_path);
            let position = self.imports.iter().filter(|i| i.folder_id == folder.folder.id).count() as i64;
            self.imports.push(SecretImport {
                id: SecretImportId::new(),
                folder_id: folder.folder.id,
                position,
                import_environment_id: source.environment.id.clone(),
                import_environment_slug: source.environment.slug.clone(),
                import_path: source.folder.path.clone(),
                is_replication,
                is_reserved: false,
                reserved_for_import_id: None,
                last_replicated_at: None,
                replication_error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }

        /// Import a path that has no folder.
        fn dangling_import(&mut self, env: &str, path: &str, missing_path: &str) {
            let folder = self.folder_context(env, path);
            self.imports.push(SecretImport {
                id: SecretImportId::new(),
                folder_id: folder.folder.id,
                position: 0,
                import_environment_id: folder.environment.id.clone(),
                import_environment_slug: folder.environment.slug.clone(),
                import_path: SecretPath::parse(missing_path).unwrap(),
                is_replication: false,
                is_reserved: false,
                reserved_for_import_id: None,
                last_replicated_at: None,
                replication_error: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
        }
    }

    fn value_of(secret: &EffectiveSecret) -> String {
        String::from_utf8(secret.record.value.ciphertext.clone()).unwrap()
    }

    #[async_trait]
    impl ImportGraphSource for MemoryGraph {
        async fn folder(
            &mut self,
            environment_id: &EnvironmentId,
            path: &SecretPath,
        ) -> Result<Option<FolderContext>> {
            Ok(self
                .folders
                .iter()
                .find(|f| &f.environment.id == environment_id && &f.folder.path == path)
                .cloned())
        }

        async fn shared_secrets(&mut self, folder_id: &FolderId) -> Result<Vec<SecretRecord>> {
            Ok(self
                .secrets
                .iter()
                .filter(|s| &s.folder_id == folder_id && s.secret_type == SecretType::Shared)
                .cloned()
                .collect())
        }

        async fn personal_secrets(&mut self, folder_id: &FolderId, owner: &str) -> Result<Vec<SecretRecord>> {
            Ok(self
                .secrets
                .iter()
                .filter(|s| &s.folder_id == folder_id && s.owner_actor_id.as_deref() == Some(owner))
                .cloned()
                .collect())
        }

        async fn imports(&mut self, folder_id: &FolderId) -> Result<Vec<SecretImport>> {
            let mut imports: Vec<SecretImport> =
                self.imports.iter().filter(|i| &i.folder_id == folder_id).cloned().collect();
            imports.sort_by_key(|i| i.position);
            Ok(imports)
        }

        async fn descendants(&mut self, context: &FolderContext) -> Result<Vec<FolderContext>> {
            let mut below: Vec<FolderContext> = self
                .folders
                .iter()
                .filter(|f| {
                    f.environment.id == context.environment.id
                        && f.folder.path != context.folder.path
                        && f.folder.path.starts_with(&context.folder.path)
                })
                .cloned()
                .collect();
            below.sort_by(|a, b| a.folder.path.to_string().cmp(&b.folder.path.to_string()));
            Ok(below)
        }
    }

    #[tokio::test]
    async fn test_higher_position_import_wins() {
        let mut graph = MemoryGraph::default();
        graph.secret("prod", "/b", "X", "from-b");
        graph.secret("prod", "/c", "X", "from-c");
        graph.import("prod", "/a", "prod", "/b");
        graph.import("prod", "/a", "prod", "/c");
        let a = graph.folder_context("prod", "/a");

        let set = ImportResolver::new().effective_shared(&mut graph, &a).await.unwrap();
        assert_eq!(value_of(&set["X"]), "from-c");
        assert!(set["X"].is_imported_into(&a.folder.id));
        assert_eq!(set["X"].secret_path, SecretPath::parse("/c").unwrap());
    }

    #[tokio::test]
    async fn test_local_secret_beats_every_import() {
        let mut graph = MemoryGraph::default();
        for (i, source) in ["/i0", "/i1", "/i2"].iter().enumerate() {
            graph.secret("dev", source, "KEY", &format!("import-{}", i));
            graph.import("dev", "/app", "dev", source);
        }
        graph.secret("dev", "/app", "KEY", "local");
        let app = graph.folder_context("dev", "/app");

        let set = ImportResolver::new().effective_shared(&mut graph, &app).await.unwrap();
        assert_eq!(value_of(&set["KEY"]), "local");
        assert!(!set["KEY"].is_imported_into(&app.folder.id));
    }

    #[tokio::test]
    async fn test_transitive_imports() {
        let mut graph = MemoryGraph::default();
        graph.secret("staging", "/base", "URL", "base-url");
        graph.import("staging", "/mid", "staging", "/base");
        graph.import("prod", "/top", "staging", "/mid");
        let top = graph.folder_context("prod", "/top");

        let set = ImportResolver::new().effective_shared(&mut graph, &top).await.unwrap();
        assert_eq!(set["URL"].environment, "staging");
        assert_eq!(set["URL"].secret_path, SecretPath::parse("/base").unwrap());
    }

    #[tokio::test]
    async fn test_import_cycle_is_detected() {
        let mut graph = MemoryGraph::default();
        graph.import("dev", "/a", "dev", "/b");
        graph.import("dev", "/b", "dev", "/c");
        graph.import("dev", "/c", "dev", "/a");
        let a = graph.folder_context("dev", "/a");

        let err = ImportResolver::new().effective_shared(&mut graph, &a).await.unwrap_err();
        assert_eq!(err.graph_kind(), Some(GraphErrorKind::ImportCycle));
        match err {
            VaultlineError::Graph { chain, .. } => {
                assert_eq!(chain, vec!["dev:/a", "dev:/b", "dev:/c", "dev:/a"]);
            }
            other => panic!("expected graph error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deep_import_chain_and_cycle() {
        let mut graph = MemoryGraph::default();
        for i in 0..1000 {
            graph.import("dev", &format!("/f{}", i), "dev", &format!("/f{}", i + 1));
        }
        graph.secret("dev", "/f1000", "DEEP", "bottom");
        let top = graph.folder_context("dev", "/f0");

        let set = ImportResolver::new().effective_shared(&mut graph, &top).await.unwrap();
        assert_eq!(value_of(&set["DEEP"]), "bottom");

        graph.import("dev", "/f1000", "dev", "/f0");
        let err = ImportResolver::new().effective_shared(&mut graph, &top).await.unwrap_err();
        assert_eq!(err.graph_kind(), Some(GraphErrorKind::ImportCycle));
    }

    #[tokio::test]
    async fn test_diamond_is_not_a_cycle() {
        let mut graph = MemoryGraph::default();
        graph.secret("dev", "/shared", "S", "s");
        graph.import("dev", "/left", "dev", "/shared");
        graph.import("dev", "/right", "dev", "/shared");
        graph.import("dev", "/top", "dev", "/left");
        graph.import("dev", "/top", "dev", "/right");
        let top = graph.folder_context("dev", "/top");

        let set = ImportResolver::new().effective_shared(&mut graph, &top).await.unwrap();
        assert_eq!(value_of(&set["S"]), "s");
    }

    #[tokio::test]
    async fn test_missing_and_replicated_imports_are_skipped() {
        let mut graph = MemoryGraph::default();
        graph.secret("dev", "/copied", "R", "replicated");
        graph.dangling_import("dev", "/app", "/gone");
        graph.add_import("dev", "/app", "dev", "/copied", true);
        let app = graph.folder_context("dev", "/app");

        let set = ImportResolver::new().effective_shared(&mut graph, &app).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_personal_overlay_applies_to_viewer_only() {
        let mut graph = MemoryGraph::default();
        graph.secret("dev", "/app", "TOKEN", "shared");
        graph.personal("dev", "/app", "TOKEN", "mine", "u1");
        let app = graph.folder_context("dev", "/app");
        let mut resolver = ImportResolver::new();

        let owner = resolver.resolve(&mut graph, &app, Some("u1"), false).await.unwrap();
        assert_eq!(value_of(&owner[0].secrets[0]), "mine");
        assert_eq!(owner[0].secrets[0].record.secret_type, SecretType::Personal);

        let other = resolver.resolve(&mut graph, &app, Some("u2"), false).await.unwrap();
        assert_eq!(value_of(&other[0].secrets[0]), "shared");

        let service = resolver.resolve(&mut graph, &app, None, false).await.unwrap();
        assert_eq!(value_of(&service[0].secrets[0]), "shared");
    }

    #[tokio::test]
    async fn test_personal_secrets_do_not_flow_through_imports() {
        let mut graph = MemoryGraph::default();
        graph.personal("dev", "/base", "TOKEN", "mine", "u1");
        graph.import("dev", "/app", "dev", "/base");
        let app = graph.folder_context("dev", "/app");

        let resolved = ImportResolver::new().resolve(&mut graph, &app, Some("u1"), false).await.unwrap();
        assert!(resolved[0].secrets.is_empty());
    }

    #[tokio::test]
    async fn test_recursive_includes_descendants() {
        let mut graph = MemoryGraph::default();
        graph.secret("dev", "/app", "A", "1");
        graph.secret("dev", "/app/db", "A", "2");
        graph.secret("dev", "/app/db/replica", "B", "3");
        graph.secret("dev", "/other", "C", "4");
        let app = graph.folder_context("dev", "/app");

        let resolved = ImportResolver::new().resolve(&mut graph, &app, None, true).await.unwrap();
        let paths: Vec<String> = resolved.iter().map(|r| r.context.folder.path.to_string()).collect();
        assert_eq!(paths, vec!["/app", "/app/db", "/app/db/replica"]);
        assert_eq!(value_of(&resolved[1].secrets[0]), "2");
    }
}
