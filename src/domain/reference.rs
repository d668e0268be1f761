//! Reference token syntax.
//!
//! A secret value may embed `${...}` tokens that point at other secrets:
//!
//! - `${KEY}` refers to `KEY` in the same folder as the referencing secret.
//! - `${env.KEY}` refers to `KEY` at the root folder of environment `env`.
//! - `${env.a.b.KEY}` and `${env./a/b.KEY}` both refer to `KEY` in folder `/a/b` of `env`.
//!
//! Text that does not match the token character set is left untouched.

use super::path::SecretPath;
use crate::errors::{Result, VaultlineError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

static REFERENCE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z0-9_./-]+)\}").expect("REFERENCE_TOKEN should be a valid regex pattern")
});

static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("SECRET_KEY should be a valid regex pattern")
});

const MAX_KEY_LENGTH: usize = 255;

/// Validate a secret key for storage and for use inside reference tokens.
pub fn validate_secret_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(VaultlineError::validation_field(
            format!("Secret key must be between 1 and {} characters", MAX_KEY_LENGTH),
            "key",
        ));
    }
    if !SECRET_KEY.is_match(key) {
        return Err(VaultlineError::validation_field(
            format!("Secret key '{}' may only contain letters, digits, '_' and '-'", key),
            "key",
        ));
    }
    Ok(())
}

/// Absolute address of a secret: environment slug, folder path and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretLocator {
    pub environment: String,
    pub path: SecretPath,
    pub key: String,
}

impl SecretLocator {
    pub fn new(environment: impl Into<String>, path: SecretPath, key: impl Into<String>) -> Self {
        Self { environment: environment.into(), path, key: key.into() }
    }

    pub fn same_folder(&self, environment: &str, path: &SecretPath) -> bool {
        self.environment == environment && &self.path == path
    }
}

impl fmt::Display for SecretLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_root() {
            write!(f, "{}:/{}", self.environment, self.key)
        } else {
            write!(f, "{}:{}/{}", self.environment, self.path, self.key)
        }
    }
}

/// A parsed reference, possibly relative to the referencing secret's folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretReference {
    /// `None` for same-folder references
    pub environment: Option<String>,
    pub path: Option<SecretPath>,
    pub key: String,
}

impl SecretReference {
    pub fn is_local(&self) -> bool {
        self.environment.is_none()
    }

    /// Resolve against the folder that holds the referencing secret.
    pub fn locate(&self, base_environment: &str, base_path: &SecretPath) -> SecretLocator {
        match (&self.environment, &self.path) {
            (Some(environment), Some(path)) => {
                SecretLocator::new(environment.clone(), path.clone(), self.key.clone())
            }
            (Some(environment), None) => {
                SecretLocator::new(environment.clone(), SecretPath::root(), self.key.clone())
            }
            _ => SecretLocator::new(base_environment, base_path.clone(), self.key.clone()),
        }
    }

    fn parse(inner: &str) -> Result<Self> {
        let parts: Vec<&str> = inner.split('.').collect();
        if parts.len() == 1 {
            validate_secret_key(parts[0]).map_err(|_| invalid_token(inner, "invalid key"))?;
            return Ok(Self { environment: None, path: None, key: parts[0].to_string() });
        }

        let environment = parts[0];
        let key = parts[parts.len() - 1];
        if environment.is_empty() {
            return Err(invalid_token(inner, "environment is empty"));
        }
        if environment.contains('/') {
            return Err(invalid_token(inner, "environment may not contain '/'"));
        }
        if key.is_empty() {
            return Err(invalid_token(inner, "key is empty"));
        }
        validate_secret_key(key).map_err(|_| invalid_token(inner, "invalid key"))?;

        let segments = parts[1..parts.len() - 1]
            .iter()
            .flat_map(|middle| middle.split('/'))
            .filter(|segment| !segment.is_empty());
        let path = SecretPath::from_segments(segments)
            .map_err(|_| invalid_token(inner, "invalid folder path"))?;

        Ok(Self { environment: Some(environment.to_string()), path: Some(path), key: key.to_string() })
    }
}

fn invalid_token(inner: &str, reason: &str) -> VaultlineError {
    VaultlineError::validation_field(
        format!("Invalid secret reference '${{{}}}': {}", inner, reason),
        "value",
    )
}

/// One `${...}` occurrence with its byte span in the raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceToken {
    pub span: Range<usize>,
    pub reference: SecretReference,
}

/// Extract every reference token from a raw value, in order of appearance.
pub fn parse_references(value: &str) -> Result<Vec<ReferenceToken>> {
    REFERENCE_TOKEN
        .captures_iter(value)
        .map(|captures| {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                return Err(VaultlineError::internal("reference pattern produced no capture"));
            };
            Ok(ReferenceToken {
                span: whole.range(),
                reference: SecretReference::parse(inner.as_str())?,
            })
        })
        .collect()
}

/// Replace each token's span with the matching entry of `replacements`.
pub fn splice_references(raw: &str, tokens: &[ReferenceToken], replacements: &[String]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut cursor = 0;
    for (token, replacement) in tokens.iter().zip(replacements) {
        out.push_str(&raw[cursor..token.span.start]);
        out.push_str(replacement);
        cursor = token.span.end;
    }
    out.push_str(&raw[cursor..]);
    out
}

/// Render the shortest token that addresses `target` from a secret in `(environment, path)`.
pub fn format_reference(target: &SecretLocator, environment: &str, path: &SecretPath) -> String {
    if target.same_folder(environment, path) {
        return format!("${{{}}}", target.key);
    }
    let mut parts = Vec::with_capacity(target.path.depth() + 2);
    parts.push(target.environment.as_str());
    parts.extend(target.path.segments().iter().map(String::as_str));
    parts.push(target.key.as_str());
    format!("${{{}}}", parts.join("."))
}

/// Point every token that resolves to `from` at `to` instead. Returns `None` when nothing matched.
pub fn rewrite_references(
    raw: &str,
    environment: &str,
    path: &SecretPath,
    from: &SecretLocator,
    to: &SecretLocator,
) -> Result<Option<String>> {
    let tokens = parse_references(raw)?;
    let mut changed = false;
    let replacements: Vec<String> = tokens
        .iter()
        .map(|token| {
            if &token.reference.locate(environment, path) == from {
                changed = true;
                format_reference(to, environment, path)
            } else {
                raw[token.span.clone()].to_string()
            }
        })
        .collect();

    Ok(changed.then(|| splice_references(raw, &tokens, &replacements)))
}

/// Persisted reference edge. `environment` and `secret_path` are `None` for same-folder
/// references so the edge survives the referencing secret being moved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceEdge {
    pub environment: Option<String>,
    pub secret_path: Option<String>,
    pub secret_key: String,
}

impl From<&SecretReference> for ReferenceEdge {
    fn from(reference: &SecretReference) -> Self {
        match &reference.environment {
            Some(environment) => Self {
                environment: Some(environment.clone()),
                secret_path: Some(
                    reference.path.clone().unwrap_or_else(SecretPath::root).to_string(),
                ),
                secret_key: reference.key.clone(),
            },
            None => Self { environment: None, secret_path: None, secret_key: reference.key.clone() },
        }
    }
}

/// Distinct edges of a raw value.
pub fn extract_edges(value: &str) -> Result<Vec<ReferenceEdge>> {
    let mut edges: Vec<ReferenceEdge> = Vec::new();
    for token in parse_references(value)? {
        let edge = ReferenceEdge::from(&token.reference);
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> SecretPath {
        SecretPath::parse(raw).unwrap()
    }

    #[test]
    fn test_local_reference() {
        let tokens = parse_references("postgres://${USER}:${PASS}@db").unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(tokens[0].reference.is_local());
        assert_eq!(tokens[0].reference.key, "USER");
        assert_eq!(tokens[1].span, 19..26);
    }

    #[test]
    fn test_slash_and_dot_paths_are_equivalent() {
        let slashed = parse_references("${staging./db.HOST}").unwrap();
        let dotted = parse_references("${staging.db.HOST}").unwrap();
        assert_eq!(slashed[0].reference, dotted[0].reference);

        let locator = slashed[0].reference.locate("prod", &path("/app"));
        assert_eq!(locator, SecretLocator::new("staging", path("/db"), "HOST"));
        assert_eq!(locator.to_string(), "staging:/db/HOST");
    }

    #[test]
    fn test_two_segments_address_environment_root() {
        let tokens = parse_references("${prod.API_KEY}").unwrap();
        let locator = tokens[0].reference.locate("dev", &path("/x"));
        assert_eq!(locator, SecretLocator::new("prod", SecretPath::root(), "API_KEY"));
        assert_eq!(locator.to_string(), "prod:/API_KEY");
    }

    #[test]
    fn test_local_reference_uses_base_folder() {
        let tokens = parse_references("${TOKEN}").unwrap();
        let locator = tokens[0].reference.locate("prod", &path("/app/api"));
        assert_eq!(locator, SecretLocator::new("prod", path("/app/api"), "TOKEN"));
    }

    #[test]
    fn test_empty_environment_or_key_is_invalid() {
        assert!(parse_references("${.db.HOST}").is_err());
        assert!(parse_references("${prod.db.}").is_err());
        assert!(parse_references("${a/b}").is_err());
    }

    #[test]
    fn test_non_token_text_is_ignored() {
        assert!(parse_references("${not a token} and $HOME and {X}").unwrap().is_empty());
    }

    #[test]
    fn test_splice_replaces_in_order() {
        let raw = "${A}-${prod.B}-tail";
        let tokens = parse_references(raw).unwrap();
        let out = splice_references(raw, &tokens, &["1".to_string(), "2".to_string()]);
        assert_eq!(out, "1-2-tail");
    }

    #[test]
    fn test_format_reference_prefers_local_form() {
        let target = SecretLocator::new("prod", path("/app"), "KEY");
        assert_eq!(format_reference(&target, "prod", &path("/app")), "${KEY}");
        assert_eq!(format_reference(&target, "prod", &path("/")), "${prod.app.KEY}");

        let root = SecretLocator::new("prod", SecretPath::root(), "KEY");
        assert_eq!(format_reference(&root, "dev", &path("/")), "${prod.KEY}");
    }

    #[test]
    fn test_rewrite_references() {
        let from = SecretLocator::new("prod", path("/old"), "HOST");
        let to = SecretLocator::new("prod", path("/new"), "HOST");

        let rewritten =
            rewrite_references("h=${prod.old.HOST};p=${PORT}", "prod", &path("/"), &from, &to)
                .unwrap();
        assert_eq!(rewritten.as_deref(), Some("h=${prod.new.HOST};p=${PORT}"));

        let local = rewrite_references("${HOST}", "prod", &path("/old"), &from, &to).unwrap();
        assert_eq!(local.as_deref(), Some("${prod.new.HOST}"));

        assert!(rewrite_references("${OTHER}", "prod", &path("/old"), &from, &to)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_extract_edges_dedupes() {
        let edges = extract_edges("${A}${A}${staging./db.HOST}").unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[1].environment.as_deref(), Some("staging"));
        assert_eq!(edges[1].secret_path.as_deref(), Some("/db"));
    }

    #[test]
    fn test_validate_secret_key() {
        assert!(validate_secret_key("DB_HOST-2").is_ok());
        assert!(validate_secret_key("").is_err());
        assert!(validate_secret_key("db.host").is_err());
        assert!(validate_secret_key(&"K".repeat(256)).is_err());
    }
}
