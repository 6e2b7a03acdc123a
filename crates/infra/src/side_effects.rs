//! Translation of committed ledger events into deferred jobs, and the job
//! handlers that carry them out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use pledgebank_core::MovementId;
use pledgebank_events::EventEnvelope;
use pledgebank_ledger::{Activity, LedgerEvent, MovementCompleted, MovementRefunded};

use crate::collaborators::{Notification, NotificationTemplate, Notifier, Recipient};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::{Job, JobExecutor, JobId, JobKind, JobResult, JobStore};
use crate::store::LedgerStore;

/// Payload of an `activity.*` job: the feed entry and the pledge it records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingActivity {
    pub movement_id: MovementId,
    pub activity: Activity,
}

/// Turns ledger events into notification and activity jobs.
///
/// Jobs are fire-and-forget: they run once, after a delay, and a failure is
/// dead-lettered rather than retried.
pub struct SideEffectDispatcher<Q: JobStore> {
    jobs: Q,
    notification_delay: Duration,
    refund_notification_delay: Duration,
}

impl<Q: JobStore> SideEffectDispatcher<Q> {
    pub fn new(jobs: Q, config: &EngineConfig) -> Self {
        Self {
            jobs,
            notification_delay: config.notification_delay(),
            refund_notification_delay: config.refund_notification_delay(),
        }
    }

    pub fn jobs(&self) -> &Q {
        &self.jobs
    }

    /// Enqueue the jobs owed for one committed event.
    pub fn dispatch(
        &self,
        envelope: &EventEnvelope<LedgerEvent>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<JobId>> {
        let jobs = match envelope.payload() {
            LedgerEvent::Completed(e) if e.pledge => self.pledge_completed(e, now)?,
            LedgerEvent::Refunded(e) => self.refunded(e, now)?,
            _ => vec![],
        };

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            debug!(job_id = %job.id, kind = job.kind.type_name(), due = %job.scheduled_at, "side effect scheduled");
            ids.push(self.jobs.enqueue(job)?);
        }
        Ok(ids)
    }

    fn pledge_completed(&self, e: &MovementCompleted, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        let leaders = Notification {
            recipient: Recipient::ProjectLeaders { project: e.payee.id },
            template: NotificationTemplate::FundingSucceeded,
            payload: json!({
                "backer": e.payer.id,
                "quantity_of_credits": e.quantity_of_credits,
                "metadata": e.metadata,
            }),
        };
        let confirmation = Notification {
            recipient: Recipient::Holder { holder: e.payer },
            template: NotificationTemplate::FundingConfirmation,
            payload: json!({
                "movement_id": e.movement_id,
                "project": e.payee.id,
            }),
        };
        let activity = Activity::funded(
            e.payer.id,
            e.payee,
            json!({ "quantity_of_credits": e.quantity_of_credits.to_string() }),
            e.occurred_at,
        );

        Ok(vec![
            self.notification_job(&leaders, self.notification_delay, now)?,
            self.notification_job(&confirmation, self.notification_delay, now)?,
            deferred(
                JobKind::activity_log(activity.action.as_str()),
                to_payload(&FundingActivity {
                    movement_id: e.movement_id,
                    activity,
                })?,
                self.notification_delay,
                now,
            ),
        ])
    }

    fn refunded(&self, e: &MovementRefunded, now: DateTime<Utc>) -> EngineResult<Vec<Job>> {
        // The refunded original was a pledge, so its payee is the project.
        let Some(project) = [e.payee, e.payer].into_iter().find(|h| h.kind.is_project()) else {
            return Ok(vec![]);
        };
        let notification = Notification {
            recipient: Recipient::ProjectLeaders { project: project.id },
            template: NotificationTemplate::ProjectRefunded,
            payload: json!({
                "refund_id": e.refund_id,
                "refunded_by": e.initiated_by.id,
            }),
        };
        Ok(vec![self.notification_job(
            &notification,
            self.refund_notification_delay,
            now,
        )?])
    }

    fn notification_job(
        &self,
        notification: &Notification,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<Job> {
        Ok(deferred(
            JobKind::notification(notification.template.as_str()),
            to_payload(notification)?,
            delay,
            now,
        ))
    }
}

fn deferred(kind: JobKind, payload: serde_json::Value, delay: Duration, now: DateTime<Utc>) -> Job {
    Job::new(kind, payload, now).delayed(delay)
}

fn to_payload<T: Serialize>(value: &T) -> EngineResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| EngineError::storage(format!("job payload: {e}")))
}

/// Wire the notification and activity-feed handlers into an executor.
pub fn register_handlers<Q, L>(executor: &mut JobExecutor<Q>, notifier: Arc<dyn Notifier>, ledger: L)
where
    Q: JobStore + 'static,
    L: LedgerStore + 'static,
{
    executor.register_handler("notification.*", move |job| {
        let notification: Notification = match serde_json::from_value(job.payload.clone()) {
            Ok(n) => n,
            Err(e) => return JobResult::Failure(format!("malformed notification payload: {e}")),
        };
        match notifier.deliver(&notification) {
            Ok(()) => JobResult::Success,
            Err(e) => {
                warn!(job_id = %job.id, template = notification.template.as_str(), error = %e, "notification failed");
                JobResult::Failure(e.to_string())
            }
        }
    });

    // The entry is only written while the pledge still stands: a refund (or
    // destroy) committed before this job ran leaves nothing to record.
    executor.register_handler("activity.*", move |job| {
        let FundingActivity { movement_id, activity } = match serde_json::from_value(job.payload.clone()) {
            Ok(a) => a,
            Err(e) => return JobResult::Failure(format!("malformed activity payload: {e}")),
        };
        let recorded = ledger.transaction(|tx| {
            let stands = tx
                .movement(movement_id)?
                .is_some_and(|m| m.is_completed() && !m.is_refunded());
            if stands {
                tx.insert_activity(activity)?;
            }
            Ok(stands)
        });
        match recorded {
            Ok(true) => JobResult::Success,
            Ok(false) => {
                debug!(job_id = %job.id, movement_id = %movement_id, "pledge no longer stands; activity skipped");
                JobResult::Success
            }
            Err(e) => JobResult::Failure(e.to_string()),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledgebank_core::{HolderId, MovementId};
    use pledgebank_ledger::{Actor, Holder, Metadata};

    use crate::jobs::InMemoryJobStore;

    fn completed(payer: Holder, payee: Holder, pledge: bool) -> EventEnvelope<LedgerEvent> {
        let event = LedgerEvent::Completed(MovementCompleted {
            movement_id: MovementId::new(),
            payer,
            payee,
            quantity_of_credits: 40,
            pledge,
            metadata: Metadata::new(),
            occurred_at: Utc::now(),
        });
        EventEnvelope::wrap(*event.movement_id().as_uuid(), "credit_movement", 2, event)
    }

    #[test]
    fn pledge_completion_schedules_three_delayed_jobs() {
        let jobs = InMemoryJobStore::arc();
        let dispatcher = SideEffectDispatcher::new(jobs.clone(), &EngineConfig::default());
        let now = Utc::now();

        let ids = dispatcher
            .dispatch(
                &completed(Holder::user(HolderId::new()), Holder::project(HolderId::new()), true),
                now,
            )
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert!(jobs.claim_next(now + chrono::Duration::seconds(59)).unwrap().is_none());
        for id in ids {
            let job = jobs.get(id).unwrap().unwrap();
            assert_eq!(job.scheduled_at, now + chrono::Duration::seconds(60));
        }
    }

    #[test]
    fn non_pledge_completion_schedules_nothing() {
        let dispatcher = SideEffectDispatcher::new(InMemoryJobStore::arc(), &EngineConfig::default());
        let envelope = completed(
            Holder::transaction(HolderId::new()),
            Holder::user(HolderId::new()),
            false,
        );
        assert!(dispatcher.dispatch(&envelope, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn refund_notifies_the_project_side() {
        let jobs = InMemoryJobStore::arc();
        let dispatcher = SideEffectDispatcher::new(jobs.clone(), &EngineConfig::default());
        let project = Holder::project(HolderId::new());
        let event = LedgerEvent::Refunded(MovementRefunded {
            movement_id: MovementId::new(),
            refund_id: MovementId::new(),
            payer: Holder::user(HolderId::new()),
            payee: project,
            quantity_of_credits: 5,
            initiated_by: Actor::new(HolderId::new(), "Support"),
            occurred_at: Utc::now(),
        });
        let envelope = EventEnvelope::wrap(*event.movement_id().as_uuid(), "credit_movement", 3, event);

        let ids = dispatcher.dispatch(&envelope, Utc::now()).unwrap();

        let job = jobs.get(ids[0]).unwrap().unwrap();
        let notification: Notification = serde_json::from_value(job.payload).unwrap();
        assert_eq!(notification.template, NotificationTemplate::ProjectRefunded);
        assert_eq!(notification.recipient, Recipient::ProjectLeaders { project: project.id });
    }
}
