//! Normalized folder paths.
//!
//! A [`SecretPath`] is an absolute, slash-separated sequence of folder names. The root
//! folder is `/`. Parsing collapses repeated and trailing slashes so that `/app//db/`
//! and `/app/db` address the same folder.

use crate::errors::{Result, VaultlineError};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static FOLDER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("FOLDER_NAME should be a valid regex pattern")
});

/// Returns true if `name` is a valid single folder name.
pub fn is_valid_folder_name(name: &str) -> bool {
    FOLDER_NAME.is_match(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretPath {
    segments: Vec<String>,
}

impl SecretPath {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }

    /// Parse and normalize a path. Relative input is treated as rooted.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.trim().split('/').filter(|s| !s.is_empty()) {
            if !is_valid_folder_name(segment) {
                return Err(VaultlineError::validation_field(
                    format!("Invalid folder name '{}' in path '{}'", segment, raw),
                    "path",
                ));
            }
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments, validating each.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut path = Self::root();
        for segment in segments {
            path = path.join(segment.as_ref())?;
        }
        Ok(path)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<SecretPath> {
        if self.is_root() {
            return None;
        }
        Some(Self { segments: self.segments[..self.segments.len() - 1].to_vec() })
    }

    pub fn join(&self, name: &str) -> Result<SecretPath> {
        if !is_valid_folder_name(name) {
            return Err(VaultlineError::validation_field(
                format!("Invalid folder name '{}'", name),
                "path",
            ));
        }
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// True if `self` equals `ancestor` or lies below it.
    pub fn starts_with(&self, ancestor: &SecretPath) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// Path of `self` relative to `ancestor` without a leading slash, empty when equal.
    pub fn relative_to(&self, ancestor: &SecretPath) -> Option<String> {
        if !self.starts_with(ancestor) {
            return None;
        }
        Some(self.segments[ancestor.segments.len()..].join("/"))
    }

    /// Every path from the root down to and including `self`.
    pub fn ancestors_inclusive(&self) -> Vec<SecretPath> {
        (0..=self.segments.len()).map(|n| Self { segments: self.segments[..n].to_vec() }).collect()
    }
}

impl Default for SecretPath {
    fn default() -> Self {
        Self::root()
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for SecretPath {
    type Err = VaultlineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SecretPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SecretPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SecretPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
