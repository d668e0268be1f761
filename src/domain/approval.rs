//! Approval policies and requests.

use super::id::{
    ApprovalPolicyId, ApprovalRequestId, EnvironmentId, FolderId, ProjectId,
};
use super::operation::SecretOperation;
use super::path::SecretPath;
use crate::errors::{Result, VaultlineError};
use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

const PATH_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    #[default]
    Hard,
    /// Listed bypassers may apply an open request without reaching the threshold
    Soft,
}

impl EnforcementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementLevel::Hard => "hard",
            EnforcementLevel::Soft => "soft",
        }
    }
}

impl FromStr for EnforcementLevel {
    type Err = VaultlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hard" => Ok(EnforcementLevel::Hard),
            "soft" => Ok(EnforcementLevel::Soft),
            other => Err(VaultlineError::validation_field(
                format!("Unknown enforcement level '{}'", other),
                "enforcement_level",
            )),
        }
    }
}

/// `Open -> Approved -> Applied` or `Open -> Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    Approved,
    Rejected,
    Applied,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Applied => "applied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Applied | RequestStatus::Rejected)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = VaultlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(RequestStatus::Open),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "applied" => Ok(RequestStatus::Applied),
            other => Err(VaultlineError::validation_field(
                format!("Unknown request status '{}'", other),
                "status",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = VaultlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            other => Err(VaultlineError::validation(format!("Unknown review status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub id: ApprovalPolicyId,
    pub project_id: ProjectId,
    pub environment_id: EnvironmentId,
    pub name: String,
    /// Folder path glob, e.g. `/app` or `/app/*`
    pub secret_path: String,
    /// Number of distinct approvals required
    pub approvals: u32,
    /// When non-empty, only these actors may approve
    pub approvers: Vec<String>,
    /// When empty under Soft enforcement, any actor may bypass
    pub bypassers: Vec<String>,
    pub enforcement_level: EnforcementLevel,
    pub allow_self_approval: bool,
    pub enabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalPolicy {
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }

    pub fn may_approve(&self, actor_id: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == actor_id)
    }

    pub fn may_bypass(&self, actor_id: &str) -> bool {
        self.enforcement_level == EnforcementLevel::Soft
            && (self.bypassers.is_empty() || self.bypassers.iter().any(|a| a == actor_id))
    }
}

/// Validate a policy path glob.
pub fn compile_policy_path(glob: &str) -> Result<Pattern> {
    if !glob.starts_with('/') {
        return Err(VaultlineError::validation_field(
            format!("Policy path '{}' must be absolute", glob),
            "secret_path",
        ));
    }
    Pattern::new(glob).map_err(|e| {
        VaultlineError::validation_field(format!("Invalid policy path '{}': {}", glob, e), "secret_path")
    })
}

/// Policy with its glob compiled, ready for matching.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: ApprovalPolicy,
    pattern: Pattern,
    literal_prefix_len: usize,
    is_literal: bool,
    segment_count: usize,
}

impl CompiledPolicy {
    pub fn compile(policy: ApprovalPolicy) -> Result<Self> {
        let pattern = compile_policy_path(&policy.secret_path)?;
        let glob = policy.secret_path.as_str();
        let literal_prefix_len = glob.find(['*', '?', '[']).unwrap_or(glob.len());
        let is_literal = literal_prefix_len == glob.len();
        let segment_count = glob.split('/').filter(|s| !s.is_empty()).count();
        Ok(Self { policy, pattern, literal_prefix_len, is_literal, segment_count })
    }

    pub fn matches(&self, path: &SecretPath) -> bool {
        let rendered = path.to_string();
        if self.is_literal {
            return SecretPath::parse(&self.policy.secret_path).map(|p| &p == path).unwrap_or(false);
        }
        self.pattern.matches_with(&rendered, PATH_MATCH_OPTIONS)
    }

    /// Exact paths beat globs, then longer literal prefix, more segments, older policy.
    fn specificity(&self) -> (bool, usize, usize, Reverse<DateTime<Utc>>) {
        (self.is_literal, self.literal_prefix_len, self.segment_count, Reverse(self.policy.created_at))
    }
}

/// Most specific active policy matching `path`.
pub fn most_specific_policy<'a>(
    policies: &'a [CompiledPolicy],
    path: &SecretPath,
) -> Option<&'a CompiledPolicy> {
    policies
        .iter()
        .filter(|p| p.policy.is_active() && p.matches(path))
        .max_by_key(|p| p.specificity())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReview {
    pub actor_id: String,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub project_id: ProjectId,
    pub policy_id: ApprovalPolicyId,
    pub folder_id: FolderId,
    pub environment_id: EnvironmentId,
    pub secret_path: SecretPath,
    pub committer_actor_id: String,
    pub status: RequestStatus,
    pub operations: Vec<SecretOperation>,
    pub reviews: Vec<ApprovalReview>,
    pub bypass_reason: Option<String>,
    pub last_apply_error: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Distinct approving actors that count toward `policy`'s threshold.
    pub fn counted_approvals(&self, policy: &ApprovalPolicy) -> usize {
        self.reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Approved)
            .filter(|r| policy.may_approve(&r.actor_id))
            .filter(|r| policy.allow_self_approval || r.actor_id != self.committer_actor_id)
            .count()
    }

    pub fn approvers(&self) -> Vec<&str> {
        self.reviews
            .iter()
            .filter(|r| r.status == ReviewStatus::Approved)
            .map(|r| r.actor_id.as_str())
            .collect()
    }
}

/// Returned instead of an apply result when a mutation is parked for approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequestHandle {
    pub request_id: ApprovalRequestId,
    pub policy_id: ApprovalPolicyId,
    pub status: RequestStatus,
    pub operation_count: usize,
    pub required_approvals: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestStatusCounts {
    pub open: i64,
    pub approved: i64,
    pub rejected: i64,
    pub applied: i64,
}
