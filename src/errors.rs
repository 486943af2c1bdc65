//! Replication-layer error types.
//!
//! Every variant maps to a stable machine-readable `code` string and an
//! HTTP status.  The enum implements [`axum::response::IntoResponse`] so
//! handlers can simply return `Err(ReplicationError::NoLeader)` and get a
//! JSON error body.
//!
//! Taxonomy: transient cluster errors (not-leader, no-leader, proposal
//! rejected) are never fatal to the node; snapshot errors are reported and
//! retried on the next trigger; apply errors are fatal (a committed entry
//! that cannot be applied means the replica would silently diverge).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the replication state machine.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// This node is not the leader and forwarding did not produce a result.
    #[error("this node is not the leader{}", leader.as_deref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    /// No leader is currently known to this node.
    #[error("no leader is currently known")]
    NoLeader,

    /// The node is shutting down; in-flight operations are resolved with this.
    #[error("node is shutting down")]
    ShuttingDown,

    /// Leadership was lost while the operation was pending commit.
    #[error("leadership lost before the operation committed")]
    LeadershipLost,

    /// The consensus core rejected the proposal.
    #[error("proposal rejected: {0}")]
    ProposalRejected(String),

    /// The client request could not be parsed or validated.
    #[error("{0}")]
    InvalidRequest(String),

    /// The requested key does not exist.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Snapshot save or load failed.
    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    /// A committed entry could not be applied.  Fatal: the apply pipeline
    /// halts rather than diverge from its peers.
    #[error("failed to apply committed entry at index {index}: {message}")]
    Apply { index: u64, message: String },

    /// Invalid configuration (bad nodes string, missing section).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure in the log/meta/snapshot directories.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ReplicationError {
    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ReplicationError::NotLeader { .. } => "not_leader",
            ReplicationError::NoLeader => "no_leader",
            ReplicationError::ShuttingDown => "shutting_down",
            ReplicationError::LeadershipLost => "leadership_lost",
            ReplicationError::ProposalRejected(_) => "proposal_rejected",
            ReplicationError::InvalidRequest(_) => "invalid_request",
            ReplicationError::NotFound(_) => "not_found",
            ReplicationError::Snapshot(_) => "snapshot_failed",
            ReplicationError::Apply { .. } => "apply_failed",
            ReplicationError::Config(_) => "invalid_config",
            ReplicationError::Io(_) => "internal_error",
            ReplicationError::Internal(_) => "internal_error",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ReplicationError::NotLeader { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ReplicationError::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            ReplicationError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ReplicationError::LeadershipLost => StatusCode::SERVICE_UNAVAILABLE,
            ReplicationError::ProposalRejected(_) => StatusCode::SERVICE_UNAVAILABLE,
            ReplicationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ReplicationError::NotFound(_) => StatusCode::NOT_FOUND,
            ReplicationError::Snapshot(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ReplicationError::Apply { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ReplicationError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ReplicationError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ReplicationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is fatal to the node (apply-path divergence).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicationError::Apply { .. })
    }
}

impl IntoResponse for ReplicationError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "request_id": request_id,
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
                ("server", "replistore".to_string()),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

// -- Tests --------------------------------------------------------------------
