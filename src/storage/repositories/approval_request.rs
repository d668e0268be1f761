//! Approval request repository
//!
//! A request captures a batch of sealed operations for later application, plus the
//! reviews it has collected. Status moves are compare-and-swap on the current status
//! so two reviewers racing on the same request cannot both apply it.

use crate::domain::{
    ApprovalPolicyId, ApprovalRequest, ApprovalRequestId, ApprovalReview, EnvironmentId,
    FolderId, ProjectId, RequestStatus, RequestStatusCounts, ReviewStatus, SecretOperation,
    SecretPath,
};
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection};
use std::str::FromStr;
use tracing::instrument;

const REQUEST_COLUMNS: &str = "id, project_id, policy_id, folder_id, environment_id, secret_path, committer_actor_id, \
     status, operations, bypass_reason, last_apply_error, applied_at, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
struct ApprovalRequestRow {
    pub id: String,
    pub project_id: String,
    pub policy_id: String,
    pub folder_id: String,
    pub environment_id: String,
    pub secret_path: String,
    pub committer_actor_id: String,
    pub status: String,
    pub operations: String, // JSON array of sealed operations
    pub bypass_reason: Option<String>,
    pub last_apply_error: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct ReviewRow {
    pub actor_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequestRow {
    fn into_request(self, reviews: Vec<ReviewRow>) -> Result<ApprovalRequest> {
        let operations: Vec<SecretOperation> = serde_json::from_str(&self.operations)?;
        let reviews = reviews
            .into_iter()
            .map(|r| {
                Ok(ApprovalReview {
                    actor_id: r.actor_id,
                    status: ReviewStatus::from_str(&r.status)?,
                    created_at: r.created_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ApprovalRequest {
            id: ApprovalRequestId::from_string(self.id),
            project_id: ProjectId::from_string(self.project_id),
            policy_id: ApprovalPolicyId::from_string(self.policy_id),
            folder_id: FolderId::from_string(self.folder_id),
            environment_id: EnvironmentId::from_string(self.environment_id),
            secret_path: SecretPath::parse(&self.secret_path)?,
            committer_actor_id: self.committer_actor_id,
            status: RequestStatus::from_str(&self.status)?,
            operations,
            reviews,
            bypass_reason: self.bypass_reason,
            last_apply_error: self.last_apply_error,
            applied_at: self.applied_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Fields of a new, open request.
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub project_id: ProjectId,
    pub policy_id: ApprovalPolicyId,
    pub folder_id: FolderId,
    pub environment_id: EnvironmentId,
    pub secret_path: SecretPath,
    pub committer_actor_id: String,
    pub operations: Vec<SecretOperation>,
}

/// Filters for listing requests.
#[derive(Debug, Clone, Default)]
pub struct ApprovalRequestFilter {
    pub environment_id: Option<EnvironmentId>,
    pub status: Option<RequestStatus>,
    pub committer_actor_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct ApprovalRequestRepository;

impl ApprovalRequestRepository {
    #[instrument(skip(conn, new), fields(project_id = %new.project_id, policy_id = %new.policy_id, operation_count = new.operations.len()), name = "db_create_approval_request")]
    pub async fn create(
        conn: &mut SqliteConnection,
        new: &NewApprovalRequest,
    ) -> Result<ApprovalRequest> {
        let id = ApprovalRequestId::new();
        let now = Utc::now();

        sqlx::query(&format!(
            "INSERT INTO secret_approval_requests ({}) VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?, NULL, NULL, NULL, ?, ?)",
            REQUEST_COLUMNS
        ))
        .bind(id.as_str())
        .bind(new.project_id.as_str())
        .bind(new.policy_id.as_str())
        .bind(new.folder_id.as_str())
        .bind(new.environment_id.as_str())
        .bind(new.secret_path.to_string())
        .bind(&new.committer_actor_id)
        .bind(serde_json::to_string(&new.operations)?)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %new.project_id, "Failed to create approval request");
            VaultlineError::Database {
                source: e,
                context: "Failed to create approval request".to_string(),
            }
        })?;

        tracing::info!(
            request_id = %id,
            policy_id = %new.policy_id,
            secret_path = %new.secret_path,
            committer = %new.committer_actor_id,
            operation_count = new.operations.len(),
            "Created approval request"
        );

        Self::get_by_id(conn, &id)
            .await?
            .ok_or_else(|| VaultlineError::internal(format!("Request '{}' vanished after insert", id)))
    }

    #[instrument(skip(conn), fields(request_id = %id), name = "db_get_approval_request")]
    pub async fn get_by_id(
        conn: &mut SqliteConnection,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>> {
        let row = sqlx::query_as::<_, ApprovalRequestRow>(&format!(
            "SELECT {} FROM secret_approval_requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %id, "Failed to get approval request");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to get approval request '{}'", id),
            }
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let reviews = Self::reviews(conn, id).await?;
        row.into_request(reviews).map(Some)
    }

    async fn reviews(conn: &mut SqliteConnection, id: &ApprovalRequestId) -> Result<Vec<ReviewRow>> {
        sqlx::query_as::<_, ReviewRow>(
            "SELECT actor_id, status, created_at FROM secret_approval_request_reviews \
             WHERE request_id = ? ORDER BY created_at, actor_id",
        )
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %id, "Failed to load request reviews");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to load reviews of request '{}'", id),
            }
        })
    }

    /// Requests of a project, newest first.
    #[instrument(skip(conn, filter), fields(project_id = %project_id), name = "db_list_approval_requests")]
    pub async fn list(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        filter: &ApprovalRequestFilter,
    ) -> Result<Vec<ApprovalRequest>> {
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        let offset = filter.offset.unwrap_or(0).max(0);

        let rows = sqlx::query_as::<_, ApprovalRequestRow>(&format!(
            "SELECT {} FROM secret_approval_requests \
             WHERE project_id = ? AND (? IS NULL OR environment_id = ?) AND (? IS NULL OR status = ?) \
               AND (? IS NULL OR committer_actor_id = ?) \
             ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
            REQUEST_COLUMNS
        ))
        .bind(project_id.as_str())
        .bind(filter.environment_id.as_ref().map(|e| e.as_str()))
        .bind(filter.environment_id.as_ref().map(|e| e.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.committer_actor_id)
        .bind(&filter.committer_actor_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to list approval requests");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to list approval requests of project '{}'", project_id),
            }
        })?;

        let mut requests = Vec::with_capacity(rows.len());
        for row in rows {
            let id = ApprovalRequestId::from_string(row.id.clone());
            let reviews = Self::reviews(conn, &id).await?;
            requests.push(row.into_request(reviews)?);
        }
        Ok(requests)
    }

    #[instrument(skip(conn), fields(project_id = %project_id), name = "db_count_approval_requests")]
    pub async fn count_by_status(
        conn: &mut SqliteConnection,
        project_id: &ProjectId,
        environment_id: Option<&EnvironmentId>,
    ) -> Result<RequestStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM secret_approval_requests \
             WHERE project_id = ? AND (? IS NULL OR environment_id = ?) GROUP BY status",
        )
        .bind(project_id.as_str())
        .bind(environment_id.map(|e| e.as_str()))
        .bind(environment_id.map(|e| e.as_str()))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, project_id = %project_id, "Failed to count approval requests");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to count approval requests of project '{}'", project_id),
            }
        })?;

        let mut counts = RequestStatusCounts::default();
        for (status, count) in rows {
            match RequestStatus::from_str(&status)? {
                RequestStatus::Open => counts.open = count,
                RequestStatus::Approved => counts.approved = count,
                RequestStatus::Rejected => counts.rejected = count,
                RequestStatus::Applied => counts.applied = count,
            }
        }
        Ok(counts)
    }

    /// Record or replace `actor_id`'s review.
    #[instrument(skip(conn), fields(request_id = %id, actor_id = %actor_id, status = %status.as_str()), name = "db_upsert_request_review")]
    pub async fn upsert_review(
        conn: &mut SqliteConnection,
        id: &ApprovalRequestId,
        actor_id: &str,
        status: ReviewStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO secret_approval_request_reviews (request_id, actor_id, status, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (request_id, actor_id) DO UPDATE SET status = excluded.status, created_at = excluded.created_at",
        )
        .bind(id.as_str())
        .bind(actor_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %id, "Failed to record review");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to record review of request '{}'", id),
            }
        })?;

        Ok(())
    }

    /// Move a request from `from` to `to`. Returns false if it was no longer in `from`.
    #[instrument(skip(conn), fields(request_id = %id, from = %from, to = %to), name = "db_transition_approval_request")]
    pub async fn transition(
        conn: &mut SqliteConnection,
        id: &ApprovalRequestId,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<bool> {
        let now = Utc::now();
        let applied_at = (to == RequestStatus::Applied).then_some(now);

        let result = sqlx::query(
            "UPDATE secret_approval_requests SET status = ?, applied_at = COALESCE(?, applied_at), \
             last_apply_error = CASE WHEN ? = 'applied' THEN NULL ELSE last_apply_error END, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(applied_at)
        .bind(to.as_str())
        .bind(now)
        .bind(id.as_str())
        .bind(from.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %id, "Failed to transition approval request");
            VaultlineError::Database {
                source: e,
                context: format!("Failed to update status of request '{}'", id),
            }
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(conn, reason), fields(request_id = %id), name = "db_record_bypass")]
    pub async fn record_bypass(
        conn: &mut SqliteConnection,
        id: &ApprovalRequestId,
        reason: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE secret_approval_requests SET bypass_reason = ?, updated_at = ? WHERE id = ?")
            .bind(reason)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, request_id = %id, "Failed to record bypass");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to record bypass of request '{}'", id),
                }
            })?;

        Ok(())
    }

    #[instrument(skip(conn, error), fields(request_id = %id), name = "db_record_apply_error")]
    pub async fn record_apply_error(
        conn: &mut SqliteConnection,
        id: &ApprovalRequestId,
        error: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE secret_approval_requests SET last_apply_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, request_id = %id, "Failed to record apply error");
                VaultlineError::Database {
                    source: e,
                    context: format!("Failed to record apply error of request '{}'", id),
                }
            })?;

        Ok(())
    }
}
