//! Approval policy repository

use crate::domain::{
    ApprovalPolicy, ApprovalPolicyId, EnforcementLevel, EnvironmentId, ProjectId,
};
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use std::str::FromStr;
use tracing::instrument;
use validator::Validate;

const POLICY_COLUMNS: &str = "id, project_id, environment_id, name, secret_path, approvals, approvers, bypassers, \
     enforcement_level, allow_self_approval, enabled, deleted_at, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct ApprovalPolicyRow {
    pub id: String,
    pub project_id: String,
    pub environment_id: String,
    pub name: String,
    pub secret_path: String,
    pub approvals: i64,
    pub approvers: String, // JSON array of actor ids
    pub bypassers: String, // JSON array of actor ids
    pub enforcement_level: String,
    pub allow_self_approval: bool,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ApprovalPolicyRow> for ApprovalPolicy {
    type Error = VaultlineError;

    fn try_from(row: ApprovalPolicyRow) -> Result<Self> {
        Ok(ApprovalPolicy {
            id: ApprovalPolicyId::from_string(row.id),
            project_id: ProjectId::from_string(row.project_id),
            environment_id: EnvironmentId::from_string(row.environment_id),
            name: row.name,
            secret_path: row.secret_path,
            approvals: u32::try_from(row.approvals).map_err(|_| {
                VaultlineError::internal(format!("Stored approval count {} is invalid", row.approvals))
            })?,
            approvers: serde_json::from_str(&row.approvers)?,
            bypassers: serde_json::from_str(&row.bypassers)?,
            enforcement_level: EnforcementLevel::from_str(&row.enforcement_level)?,
            allow_self_approval: row.allow_self_approval,
            enabled: row.enabled,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Create approval policy request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateApprovalPolicyRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    /// Absolute folder path or glob, e.g. `/app` or `/app/*`
    #[validate(length(min = 1, max = 1024))]
    pub secret_path: String,
    #[validate(range(min = 1, max = 100))]
    pub approvals: u32,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub bypassers: Vec<String>,
    #[serde(default)]
    pub enforcement_level: EnforcementLevel,
    #[serde(default)]
    pub allow_self_approval: bool,
}

/// Update approval policy request
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateApprovalPolicyRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 1024))]
    pub secret_path: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub approvals: Option<u32>,
    pub approvers: Option<Vec<String>>,
    pub bypassers: Option<Vec<String>>,
    pub enforcement_level: Option<EnforcementLevel>,
    pub allow_self_approval: Option<bool>,
    pub enabled: Option<bool>,
}

pub struct ApprovalPolicyRepository;

impl ApprovalPolicyRepository {
    #[instrument(skip(conn, request), fields(project_id = %project_id, environment_id = %environment_id, secret_path = %request.secret_path), name = "db_create_approval_policy")]
    pub async fn create(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
        request: &CreateApprovalPolicyRequest,
    ) -> Result<ApprovalPolicy> {
        let id = ApprovalPolicyId::new();
        let now = Utc::now();

        sqlx::query(&format!(
            "INSERT INTO secret_approval_policies ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL, ?, ?)",
            POLICY_COLUMNS
        ))
        .bind(id.as_str())
        .bind(project_id.as_str())
        .bind(environment_id.as_str())
        .bind(&request.name)
        .bind(&request.secret_path)
        .bind(request.approvals as i64)
        .bind(serde_json::to_string(&request.approvers)?)
        .bind(serde_json::to_string(&request.bypassers)?)
        .bind(request.enforcement_level.as_str())
        .bind(request.allow_self_approval)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to create approval policy");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to create approval policy '{}'", request.name),
            }
        })?;

        tracing::info!(
            policy_id = %id,
            project_id = %project_id,
            environment_id = %environment_id,
            secret_path = %request.secret_path,
            approvals = request.approvals,
            "Created approval policy"
        );

        Self::get_by_id(conn, &id)
            .await?
            .ok_or_else(|| VaultlineError::internal(format!("Policy '{}' vanished after insert", id)))
    }

    /// Fetch a policy, soft-deleted ones included.
    #[instrument(skip(conn), fields(policy_id = %id), name = "db_get_approval_policy")]
    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &ApprovalPolicyId,
    ) -> Result<Option<ApprovalPolicy>> {
        let row = sqlx::query_as::<_, ApprovalPolicyRow>(&format!(
            "SELECT {} FROM secret_approval_policies WHERE id = ?",
            POLICY_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, policy_id = %id, "Failed to get approval policy");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to get approval policy '{}'", id),
            }
        })?;

        row.map(ApprovalPolicy::try_from).transpose()
    }

    /// Live (not soft-deleted) policies of an environment, oldest first.
    #[instrument(skip(conn), fields(project_id = %project_id, environment_id = %environment_id), name = "db_list_approval_policies")]
    pub async fn list_by_environment(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        environment_id: &EnvironmentId,
    ) -> Result<Vec<ApprovalPolicy>> {
        let rows = sqlx::query_as::<_, ApprovalPolicyRow>(&format!(
            "SELECT {} FROM secret_approval_policies \
             WHERE project_id = ? AND environment_id = ? AND deleted_at IS NULL ORDER BY created_at, id",
            POLICY_COLUMNS
        ))
        .bind(project_id.as_str())
        .bind(environment_id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to list approval policies");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list approval policies of environment '{}'", environment_id),
            }
        })?;

        rows.into_iter().map(ApprovalPolicy::try_from).collect()
    }

    #[instrument(skip(conn, policy), fields(policy_id = %policy.id), name = "db_update_approval_policy")]
    pub async fn update(conn: &mut SqliteConnection, policy: &ApprovalPolicy) -> Result<()> {
        let result = sqlx::query(
            "UPDATE secret_approval_policies SET name = ?, secret_path = ?, approvals = ?, approvers = ?, bypassers = ?, \
             enforcement_level = ?, allow_self_approval = ?, enabled = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&policy.name)
        .bind(&policy.secret_path)
        .bind(policy.approvals as i64)
        .bind(serde_json::to_string(&policy.approvers)?)
        .bind(serde_json::to_string(&policy.bypassers)?)
        .bind(policy.enforcement_level.as_str())
        .bind(policy.allow_self_approval)
        .bind(policy.enabled)
        .bind(Utc::now())
        .bind(policy.id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, policy_id = %policy.id, "Failed to update approval policy");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to update approval policy '{}'", policy.id),
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(VaultlineError::not_found("ApprovalPolicy", policy.id.as_str()));
        }

        Ok(())
    }

    /// Soft delete so open requests can still name their policy.
    #[instrument(skip(conn), fields(policy_id = %id), name = "db_delete_approval_policy")]
    pub async fn soft_delete(conn: &mut SqliteConnection, id: &ApprovalPolicyId) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE secret_approval_policies SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, policy_id = %id, "Failed to delete approval policy");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to delete approval policy '{}'", id),
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(VaultlineError::not_found("ApprovalPolicy", id.as_str()));
        }

        tracing::info!(policy_id = %id, "Deleted approval policy");
        Ok(())
    }
}
