//! Acting principal passed through from the authentication layer.
//!
//! The engine never evaluates permissions. It only branches on the actor kind in
//! two places: who may own Personal secrets and who sees them.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Service,
    Identity,
    ApiKey,
}

impl ActorKind {
    /// Personal secrets are scoped to a human or machine identity, never to shared credentials.
    pub fn can_own_personal_secrets(&self) -> bool {
        match self {
            ActorKind::User | ActorKind::Identity => true,
            ActorKind::Service | ActorKind::ApiKey => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Service => "service",
            ActorKind::Identity => "identity",
            ActorKind::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub kind: ActorKind,
    pub actor_id: String,
    pub org_id: String,
    pub auth_method: String,
}

impl ActorContext {
    pub fn new(kind: ActorKind, actor_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self { kind, actor_id: actor_id.into(), org_id: org_id.into(), auth_method: "unknown".into() }
    }

    pub fn user(actor_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self::new(ActorKind::User, actor_id, org_id)
    }

    pub fn with_auth_method(mut self, auth_method: impl Into<String>) -> Self {
        self.auth_method = auth_method.into();
        self
    }

    /// Owner id to use when this actor reads or writes Personal secrets.
    pub fn personal_owner(&self) -> Option<&str> {
        if self.kind.can_own_personal_secrets() {
            Some(&self.actor_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_personal_ownership_by_kind() {
        assert!(ActorContext::user("u1", "org").personal_owner().is_some());
        assert!(ActorContext::new(ActorKind::Identity, "i1", "org").personal_owner().is_some());
        assert!(ActorContext::new(ActorKind::Service, "s1", "org").personal_owner().is_none());
        assert!(ActorContext::new(ActorKind::ApiKey, "k1", "org").personal_owner().is_none());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&ActorKind::ApiKey).unwrap(), "\"api_key\"");
    }
}
