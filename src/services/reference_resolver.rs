//! Reference expansion
//!
//! Expands `${...}` tokens in a decrypted value by walking the reference graph
//! depth-first. The walk is iterative over an explicit frame stack, so chains of
//! any length are bounded only by `max_depth`, never by the call stack.
//!
//! The graph is recorded as an arena of nodes addressed by index. Cycle detection
//! checks the home locator of a target against the locators currently on the walk
//! path; the depth bound is checked independently.

use crate::domain::reference::{parse_references, splice_references, ReferenceToken};
use crate::domain::{SecretLocator, SecretPath};
use crate::errors::{GraphErrorKind, Result, VaultlineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::iter;
use tracing::{debug, instrument};

/// Default bound on reference hops from the secret being expanded.
pub const DEFAULT_MAX_REFERENCE_DEPTH: usize = 10;

/// A referenced secret's decrypted value together with where it actually lives.
///
/// `locator` differs from the requested locator when the key was found through an
/// import; local references inside `value` resolve relative to it.
#[derive(Debug, Clone)]
pub struct LocatedValue {
    pub locator: SecretLocator,
    pub value: String,
}

/// Looks up the raw value of a referenced secret.
#[async_trait]
pub trait ReferenceSource: Send {
    async fn lookup(&mut self, locator: &SecretLocator) -> Result<Option<LocatedValue>>;
}

/// What to do when a token points at a secret that does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// Substitute an empty string
    #[default]
    Empty,
    /// Fail with `UNRESOLVED_REFERENCE`
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub max_depth: usize,
    pub on_unresolved: UnresolvedPolicy,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_REFERENCE_DEPTH, on_unresolved: UnresolvedPolicy::Empty }
    }
}

impl ResolveOptions {
    pub fn expand(max_depth: usize) -> Self {
        Self { max_depth, on_unresolved: UnresolvedPolicy::Empty }
    }

    pub fn validate(max_depth: usize) -> Self {
        Self { max_depth, on_unresolved: UnresolvedPolicy::Fail }
    }
}

/// Whether the secret being expanded is a shared secret or a personal overlay.
///
/// A personal secret shares its locator with the shared secret of the same key, but
/// lookups only ever return shared secrets, so a personal root is never part of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootKind {
    #[default]
    Shared,
    Personal,
}

pub type NodeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceNode {
    pub environment: String,
    pub secret_path: SecretPath,
    pub key: String,
    /// Fully expanded value
    pub value: String,
    /// The token pointed at a secret that does not exist
    pub missing: bool,
    pub children: Vec<NodeId>,
}

/// Reference graph of one secret, rooted at `root`.
///
/// A secret referenced more than once in the same walk appears as a single node
/// shared by every parent that references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceTree {
    pub root: NodeId,
    pub nodes: Vec<ReferenceNode>,
}

impl ReferenceTree {
    pub fn root_node(&self) -> &ReferenceNode {
        &self.nodes[self.root]
    }

    pub fn node(&self, id: NodeId) -> Option<&ReferenceNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &ReferenceNode> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(move |node| node.children.iter().map(move |c| &self.nodes[*c]))
    }

    /// Blank every value, keeping the graph shape.
    pub fn mask_values(&mut self, mask: &str) {
        for node in &mut self.nodes {
            node.value = mask.to_string();
        }
    }

    fn push(&mut self, locator: &SecretLocator, missing: bool) -> NodeId {
        self.nodes.push(ReferenceNode {
            environment: locator.environment.clone(),
            secret_path: locator.path.clone(),
            key: locator.key.clone(),
            value: String::new(),
            missing,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }
}

struct Frame {
    node: NodeId,
    home: SecretLocator,
    requested: Option<SecretLocator>,
    raw: String,
    tokens: Vec<ReferenceToken>,
    replacements: Vec<String>,
    next: usize,
    depth: usize,
    /// Longest chain of hops below this frame settled so far
    height: usize,
}

impl Frame {
    fn new(
        node: NodeId,
        home: SecretLocator,
        requested: Option<SecretLocator>,
        raw: String,
        depth: usize,
    ) -> Result<Self> {
        let tokens = parse_references(&raw)?;
        Ok(Self {
            node,
            home,
            requested,
            replacements: Vec::with_capacity(tokens.len()),
            raw,
            tokens,
            next: 0,
            depth,
            height: 0,
        })
    }

    /// Settle the current token with a child whose own subtree is `child_height` hops tall.
    fn settle(&mut self, value: String, child_height: usize) {
        self.replacements.push(value);
        self.height = self.height.max(child_height + 1);
        self.next += 1;
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    value: String,
    height: usize,
}

/// Expands references, memoizing fully resolved targets for the lifetime of the resolver.
///
/// One resolver should serve one read: the memo never observes writes made after it
/// was filled.
pub struct ReferenceResolver {
    options: ResolveOptions,
    memo: HashMap<SecretLocator, Resolved>,
}

impl ReferenceResolver {
    pub fn new(options: ResolveOptions) -> Self {
        Self { options, memo: HashMap::new() }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Expand `raw`, the value of the secret at `home`.
    pub async fn resolve<S>(&mut self, source: &mut S, home: &SecretLocator, raw: &str) -> Result<String>
    where
        S: ReferenceSource + ?Sized,
    {
        self.resolve_as(source, home, RootKind::Shared, raw).await
    }

    /// Expand `raw`, the value of a secret of kind `kind` living at `home`.
    pub async fn resolve_as<S>(
        &mut self,
        source: &mut S,
        home: &SecretLocator,
        kind: RootKind,
        raw: &str,
    ) -> Result<String>
    where
        S: ReferenceSource + ?Sized,
    {
        if !raw.contains("${") {
            return Ok(raw.to_string());
        }
        let tree = self.walk(source, home, kind, raw).await?;
        Ok(tree.nodes[tree.root].value.clone())
    }

    /// Expand `raw` and return the reference graph walked to do it.
    pub async fn tree<S>(&mut self, source: &mut S, home: &SecretLocator, raw: &str) -> Result<ReferenceTree>
    where
        S: ReferenceSource + ?Sized,
    {
        self.walk(source, home, RootKind::Shared, raw).await
    }

    pub async fn tree_as<S>(
        &mut self,
        source: &mut S,
        home: &SecretLocator,
        kind: RootKind,
        raw: &str,
    ) -> Result<ReferenceTree>
    where
        S: ReferenceSource + ?Sized,
    {
        self.walk(source, home, kind, raw).await
    }

    #[instrument(skip(self, source, raw), fields(root = %home, max_depth = self.options.max_depth), name = "resolve_references")]
    async fn walk<S>(
        &mut self,
        source: &mut S,
        home: &SecretLocator,
        kind: RootKind,
        raw: &str,
    ) -> Result<ReferenceTree>
    where
        S: ReferenceSource + ?Sized,
    {
        let mut tree = ReferenceTree { root: 0, nodes: Vec::new() };
        let mut nodes_by_locator: HashMap<SecretLocator, NodeId> = HashMap::new();
        let mut on_path: HashSet<SecretLocator> = HashSet::new();

        let root = tree.push(home, false);
        if kind == RootKind::Shared {
            on_path.insert(home.clone());
        }
        let mut stack = vec![Frame::new(root, home.clone(), None, raw.to_string(), 0)?];

        loop {
            let Some(frame) = stack.last_mut() else {
                return Err(VaultlineError::internal("Reference walk ended without a root value"));
            };

            if frame.next == frame.tokens.len() {
                let Some(done) = stack.pop() else { continue };
                if done.requested.is_some() || kind == RootKind::Shared {
                    on_path.remove(&done.home);
                }
                let value = splice_references(&done.raw, &done.tokens, &done.replacements);
                tree.nodes[done.node].value = value.clone();

                if let Some(requested) = done.requested {
                    nodes_by_locator.insert(requested.clone(), done.node);
                    self.memo.insert(requested, Resolved { value: value.clone(), height: done.height });
                }

                match stack.last_mut() {
                    Some(parent) => parent.settle(value, done.height),
                    None => {
                        debug!(nodes = tree.nodes.len(), "Resolved reference graph");
                        return Ok(tree);
                    }
                }
                continue;
            }

            let parent_node = frame.node;
            let depth = frame.depth + 1;
            let requested =
                frame.tokens[frame.next].reference.locate(&frame.home.environment, &frame.home.path);

            if depth > self.options.max_depth {
                return Err(depth_exceeded(self.options.max_depth, &stack, &requested));
            }

            if let Some(resolved) = self.memo.get(&requested) {
                // The memoized subtree still counts against the bound from this depth.
                if depth + resolved.height > self.options.max_depth {
                    return Err(depth_exceeded(self.options.max_depth, &stack, &requested));
                }
                let (value, height) = (resolved.value.clone(), resolved.height);
                let child = match nodes_by_locator.get(&requested) {
                    Some(id) => *id,
                    None => {
                        let id = tree.push(&requested, false);
                        tree.nodes[id].value = value.clone();
                        nodes_by_locator.insert(requested.clone(), id);
                        id
                    }
                };
                tree.nodes[parent_node].children.push(child);
                frame.settle(value, height);
                continue;
            }

            let Some(found) = source.lookup(&requested).await? else {
                if self.options.on_unresolved == UnresolvedPolicy::Fail {
                    return Err(VaultlineError::graph(
                        GraphErrorKind::UnresolvedReference,
                        format!("Referenced secret '{}' does not exist", requested),
                        stack.iter().map(|f| f.home.to_string()).collect(),
                    ));
                }
                let child = tree.push(&requested, true);
                tree.nodes[parent_node].children.push(child);
                if let Some(frame) = stack.last_mut() {
                    frame.settle(String::new(), 0);
                }
                continue;
            };

            if on_path.contains(&found.locator) {
                let start = stack
                    .iter()
                    .rposition(|f| f.home == found.locator && (f.requested.is_some() || kind == RootKind::Shared))
                    .unwrap_or(0);
                let chain: Vec<String> = stack[start..]
                    .iter()
                    .map(|f| f.home.to_string())
                    .chain(iter::once(found.locator.to_string()))
                    .collect();
                return Err(VaultlineError::graph(
                    GraphErrorKind::CycleDetected,
                    format!("Reference cycle detected: {}", chain.join(" -> ")),
                    chain,
                ));
            }

            let child = tree.push(&found.locator, false);
            tree.nodes[parent_node].children.push(child);
            on_path.insert(found.locator.clone());
            stack.push(Frame::new(child, found.locator, Some(requested), found.value, depth)?);
        }
    }
}

fn depth_exceeded(max_depth: usize, stack: &[Frame], requested: &SecretLocator) -> VaultlineError {
    VaultlineError::graph(
        GraphErrorKind::DepthExceeded,
        format!("Reference depth exceeded {} while resolving '{}'", max_depth, requested),
        stack
            .iter()
            .map(|f| f.home.to_string())
            .chain(iter::once(requested.to_string()))
            .collect(),
    )
}
