//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job kind, used to route a job to its handler.
///
/// Handlers register against [`JobKind::type_name`], either exactly
/// (`"notification.funding_succeeded"`) or by category (`"notification.*"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Deliver a templated notification (email) to someone.
    Notification { template: String },
    /// Append an entry to the activity feed.
    ActivityLog { action: String },
}

impl JobKind {
    pub fn notification(template: impl AsRef<str>) -> Self {
        Self::Notification {
            template: format!("notification.{}", template.as_ref()),
        }
    }

    pub fn activity_log(action: impl AsRef<str>) -> Self {
        Self::ActivityLog {
            action: format!("activity.{}", action.as_ref()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            JobKind::Notification { template } => template,
            JobKind::ActivityLog { action } => action,
        }
    }
}

/// Job execution status.
///
/// Jobs run at most once: a failure goes straight to the dead-letter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting until `scheduled_at`
    Pending,
    /// Claimed by an executor
    Running,
    Completed,
    DeadLettered { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest instant the job may run.
    pub scheduled_at: DateTime<Utc>,
}

impl Job {
    /// Create a job that is due immediately.
    pub fn new(kind: JobKind, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            payload,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            scheduled_at: now,
        }
    }

    /// Push the due time `delay` past the creation instant.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at = self.created_at + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_at
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.is_due(now)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::DeadLettered { error };
        self.updated_at = now;
    }
}

/// Outcome reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    Failure(String),
}

/// Entry in the dead-letter list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_namespaced() {
        assert_eq!(
            JobKind::notification("funding_succeeded").type_name(),
            "notification.funding_succeeded"
        );
        assert_eq!(JobKind::activity_log("funded").type_name(), "activity.funded");
    }

    #[test]
    fn delayed_job_is_not_due_before_its_time() {
        let now = Utc::now();
        let job = Job::new(JobKind::activity_log("funded"), serde_json::json!({}), now)
            .delayed(Duration::from_secs(60));

        assert!(!job.is_due(now + chrono::Duration::seconds(59)));
        assert!(job.is_due(now + chrono::Duration::seconds(60)));
    }

    #[test]
    fn failure_dead_letters_on_first_attempt() {
        let now = Utc::now();
        let mut job = Job::new(JobKind::notification("funding_succeeded"), serde_json::json!({}), now);

        job.mark_running(now);
        job.mark_failed("smtp down".to_string(), now);

        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: "smtp down".to_string()
            }
        );
        assert!(job.status.is_terminal());
        assert!(!job.is_claimable(now));
    }
}
