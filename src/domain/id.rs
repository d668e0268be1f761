//! Domain ID Types with NewType Pattern
//!
//! Type-safe wrappers for identifiers so a folder id can never be passed where a
//! secret id is expected. Each ID type implements Display, FromStr, Serialize,
//! Deserialize and the SQLx traits needed to bind and decode it directly.

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Macro to generate NewType ID wrappers with all required traits
macro_rules! domain_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create an ID from an existing string (for database retrieval)
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Get the inner string value
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Convert to inner string value
            pub fn into_string(self) -> String {
                self.0
            }

            /// Parse and validate a UUID string
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s)?;
                Ok(Self(s.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl Type<Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <String as Type<Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <String as Type<Sqlite>>::compatible(ty)
            }
        }

        impl<'q> Encode<'q, Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<IsNull, BoxDynError> {
                <String as Encode<'q, Sqlite>>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> Decode<'r, Sqlite> for $name {
            fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <String as Decode<'r, Sqlite>>::decode(value)?;
                Ok(Self(s))
            }
        }
    };
}

domain_id!(
    /// Unique identifier for a project (tenant boundary and envelope context)
    ProjectId
);

domain_id!(
    /// Unique identifier for an environment within a project
    EnvironmentId
);

domain_id!(
    /// Unique identifier for a folder in an environment's tree
    FolderId
);

domain_id!(
    /// Unique identifier for a live secret
    SecretId
);

domain_id!(
    /// Unique identifier for one entry of a secret's version history
    SecretVersionId
);

domain_id!(
    /// Unique identifier for a folder import
    SecretImportId
);

domain_id!(
    /// Unique identifier for an approval policy
    ApprovalPolicyId
);

domain_id!(
    /// Unique identifier for an approval request
    ApprovalRequestId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SecretId::new(), SecretId::new());
    }

    #[test]
    fn test_parse_rejects_non_uuid() {
        assert!(FolderId::parse("not-a-uuid").is_err());
        let id = FolderId::new();
        assert_eq!(FolderId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = ApprovalRequestId::from_string("00000000-0000-0000-0000-000000000001".into());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000001\"");
        let back: ApprovalRequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
