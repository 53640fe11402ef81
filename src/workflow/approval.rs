//! Human-in-the-loop approval gate.
//!
//! The engine files an [`ApprovalRequest`] for every task that requires
//! approval and waits on it; an external actor resolves it through
//! [`ApprovalQueue::approve`] or [`ApprovalQueue::reject`]. Every request is
//! resolved exactly once: approve, reject and expiry race under one lock and
//! the first transition out of `pending` wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{FlowError, Result};
use crate::telemetry::add_metric;

/// Default decision budget for an approval request
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 300;

/// Resolution state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a decision
    #[default]
    Pending,
    /// Approved by a resolver
    Approved,
    /// Rejected by a resolver
    Rejected,
    /// No decision arrived in time
    Expired,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A request for a human decision on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier for this request
    pub id: String,

    /// Task the decision gates
    pub task_id: String,

    /// Who asked for the decision (usually the task's agent)
    pub requester: String,

    /// What is being approved
    pub action: String,

    /// Details shown to the resolver
    pub payload: Value,

    /// Resolution state
    pub status: ApprovalStatus,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Resolution time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    /// Decision budget in seconds
    pub timeout_seconds: u64,

    /// Approval comment or rejection reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalRequest {
    fn new(
        task_id: &str,
        requester: &str,
        action: &str,
        payload: Value,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            requester: requester.to_string(),
            action: action.to_string(),
            payload,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            timeout_seconds,
            comment: None,
        }
    }

    /// Get the timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether a decision (or expiry) has been recorded
    pub fn is_resolved(&self) -> bool {
        self.status != ApprovalStatus::Pending
    }

    fn outcome(&self) -> ApprovalOutcome {
        ApprovalOutcome {
            request_id: self.id.clone(),
            status: self.status,
            comment: self.comment.clone(),
        }
    }
}

/// What a waiter observes once a request is resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    /// ID of the resolved request
    pub request_id: String,

    /// Final status, never `pending`
    pub status: ApprovalStatus,

    /// Approval comment or rejection reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalOutcome {
    /// Check if the request was approved
    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }
}

/// A request plus the channel its waiter listens on
#[derive(Debug)]
struct PendingApproval {
    request: ApprovalRequest,
    deadline: Instant,
    notifier: watch::Sender<Option<ApprovalOutcome>>,
}

/// Shared store of approval requests.
///
/// Cloning yields another handle to the same queue, so the engine and an
/// external resolver can hold it at once.
#[derive(Debug, Clone, Default)]
pub struct ApprovalQueue {
    requests: Arc<Mutex<HashMap<String, PendingApproval>>>,
}

impl ApprovalQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// File a new pending request
    #[instrument(skip(self, payload))]
    pub async fn create_request(
        &self,
        task_id: &str,
        requester: &str,
        action: &str,
        payload: Value,
        timeout_seconds: u64,
    ) -> ApprovalRequest {
        let request = ApprovalRequest::new(task_id, requester, action, payload, timeout_seconds);
        let (notifier, _) = watch::channel(None);
        let pending = PendingApproval {
            request: request.clone(),
            deadline: deadline_after(request.timeout()),
            notifier,
        };

        self.requests
            .lock()
            .await
            .insert(request.id.clone(), pending);

        info!(
            request_id = %request.id,
            task_id = %task_id,
            requester = %requester,
            action = %action,
            "Approval requested"
        );
        request
    }

    /// Get a request by id
    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests
            .lock()
            .await
            .get(request_id)
            .map(|p| p.request.clone())
    }

    /// Requests still awaiting a decision, oldest first
    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .lock()
            .await
            .values()
            .filter(|p| p.request.status == ApprovalStatus::Pending)
            .map(|p| p.request.clone())
            .collect();
        sort_by_creation(&mut pending);
        pending
    }

    /// Every request, oldest first
    pub async fn list_all(&self) -> Vec<ApprovalRequest> {
        let mut all: Vec<ApprovalRequest> = self
            .requests
            .lock()
            .await
            .values()
            .map(|p| p.request.clone())
            .collect();
        sort_by_creation(&mut all);
        all
    }

    /// Approve a request. Returns the request as stored; if it was already
    /// resolved the earlier decision stands and is returned unchanged.
    pub async fn approve(
        &self,
        request_id: &str,
        comment: impl Into<String>,
    ) -> Result<ApprovalRequest> {
        self.resolve(request_id, ApprovalStatus::Approved, Some(comment.into()))
            .await
    }

    /// Reject a request. Same first-decision-wins rule as [`ApprovalQueue::approve`].
    pub async fn reject(
        &self,
        request_id: &str,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest> {
        self.resolve(request_id, ApprovalStatus::Rejected, Some(reason.into()))
            .await
    }

    /// Mark a request expired unless it was already resolved
    pub async fn expire(&self, request_id: &str) -> Result<ApprovalRequest> {
        self.resolve(request_id, ApprovalStatus::Expired, None).await
    }

    #[instrument(skip(self, comment))]
    async fn resolve(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        comment: Option<String>,
    ) -> Result<ApprovalRequest> {
        let mut requests = self.requests.lock().await;
        let pending = requests
            .get_mut(request_id)
            .ok_or_else(|| FlowError::ApprovalNotFound(request_id.to_string()))?;

        if pending.request.is_resolved() {
            warn!(
                request_id = %request_id,
                current = %pending.request.status,
                ignored = %status,
                "Approval request already resolved; decision ignored"
            );
            return Ok(pending.request.clone());
        }

        pending.request.status = status;
        pending.request.resolved_at = Some(Utc::now());
        pending.request.comment = comment;
        // No receiver is fine: a later wait() reads the stored status
        let _ = pending.notifier.send(Some(pending.request.outcome()));

        match status {
            ApprovalStatus::Expired => {
                warn!(request_id = %request_id, action = %pending.request.action, "Approval expired")
            }
            _ => {
                info!(request_id = %request_id, action = %pending.request.action, status = %status, "Approval resolved")
            }
        }

        Ok(pending.request.clone())
    }

    /// Suspend until the request is resolved or its timeout elapses. An
    /// elapsed timeout resolves the request as `expired` and returns that
    /// outcome rather than an error.
    #[instrument(skip(self))]
    pub async fn wait(&self, request_id: &str) -> Result<ApprovalOutcome> {
        let start = std::time::Instant::now();

        let (mut receiver, deadline) = {
            let requests = self.requests.lock().await;
            let pending = requests
                .get(request_id)
                .ok_or_else(|| FlowError::ApprovalNotFound(request_id.to_string()))?;

            if pending.request.is_resolved() {
                return Ok(pending.request.outcome());
            }
            (pending.notifier.subscribe(), pending.deadline)
        };

        debug!(request_id = %request_id, "Waiting for approval decision");

        let outcome = match timeout_at(deadline, receiver.wait_for(|o| o.is_some())).await {
            Ok(Ok(outcome)) => outcome.clone(),
            // The sender lives in the map; it only drops if the entry does
            Ok(Err(_)) | Err(_) => None,
        };

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => self.expire(request_id).await?.outcome(),
        };

        add_metric(
            "approval_wait_ms",
            start.elapsed().as_millis() as f64,
            &[("status", outcome.status.to_string())],
        );

        Ok(outcome)
    }
}

/// `now + timeout`, saturating at roughly 30 years for huge timeouts
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}

fn sort_by_creation(requests: &mut [ApprovalRequest]) {
    requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
