//! The credit ledger service: movement creation, guarded completion, balance
//! maintenance, refunds, destruction and card-backed credit purchases.
//!
//! ## Commit discipline
//!
//! Each state change runs in one [`LedgerStore::transaction`]. Only after it
//! commits does the service
//!
//! 1. recompute the balances of the holders involved (fresh aggregation, in
//!    their own transactions),
//! 2. publish the committed events on the bus,
//! 3. hand them to the [`SideEffectDispatcher`] for deferred notifications.
//!
//! Steps 2 and 3 are best effort: failures are logged and never returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use pledgebank_core::{Aggregate, AggregateRoot, DomainError, ExpectedVersion, HolderId, MovementId};
use pledgebank_events::{EventBus, EventEnvelope, execute};
use pledgebank_ledger::{
    Activity, Actor, BalanceRecord, CompleteMovement, CreditMovement, Holder, LedgerEvent, Metadata,
    MovementCommand, OpenMovement, RecordPaymentFailure, RecordRefund, RewardDistribution,
    RewardSelection,
};

use crate::collaborators::{CardDetails, ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::JobStore;
use crate::side_effects::SideEffectDispatcher;
use crate::store::{LedgerStore, LedgerTx, MovementQuery};

/// Aggregate type recorded on published envelopes.
pub const MOVEMENT_AGGREGATE: &str = "credit_movement";

/// Request to record a new movement.
///
/// `payer`/`payee` are optional so that a missing side is reported as a
/// validation error.
#[derive(Debug, Clone, Default)]
pub struct NewMovement {
    pub payer: Option<Holder>,
    pub payee: Option<Holder>,
    pub quantity_of_credits: i64,
    pub metadata: Metadata,
    pub comments: Option<String>,
    pub rewards: RewardSelection,
}

impl NewMovement {
    pub fn new(payer: Holder, payee: Holder, quantity_of_credits: i64) -> Self {
        Self {
            payer: Some(payer),
            payee: Some(payee),
            quantity_of_credits,
            ..Self::default()
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn rewards(mut self, rewards: RewardSelection) -> Self {
        self.rewards = rewards;
        self
    }
}

/// Result of a card-backed credit purchase.
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseOutcome {
    /// The charge went through and the movement completed.
    Approved {
        movement: CreditMovement,
        authorization: String,
    },
    /// The card was refused. The movement is kept, tagged with the decline
    /// message, and never completes.
    Declined {
        movement: CreditMovement,
        error: DomainError,
    },
}

impl PurchaseOutcome {
    pub fn movement(&self) -> &CreditMovement {
        match self {
            PurchaseOutcome::Approved { movement, .. } => movement,
            PurchaseOutcome::Declined { movement, .. } => movement,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, PurchaseOutcome::Approved { .. })
    }
}

/// Events committed for one movement, starting after `from_version`.
#[derive(Debug)]
struct Committed {
    movement: CreditMovement,
    from_version: u64,
    events: Vec<LedgerEvent>,
}

impl Committed {
    fn unchanged(movement: CreditMovement) -> Self {
        Self {
            from_version: movement.version(),
            movement,
            events: vec![],
        }
    }

    fn envelopes(&self) -> Vec<EventEnvelope<LedgerEvent>> {
        let aggregate_id = *self.movement.id_typed().as_uuid();
        self.events
            .iter()
            .zip(self.from_version + 1..)
            .map(|(event, seq)| EventEnvelope::wrap(aggregate_id, MOVEMENT_AGGREGATE, seq, event.clone()))
            .collect()
    }

    fn completed(&self) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, LedgerEvent::Completed(_)))
    }
}

pub struct CreditLedger<S, Q, B>
where
    S: LedgerStore,
    Q: JobStore,
    B: EventBus<EventEnvelope<LedgerEvent>>,
{
    store: S,
    side_effects: SideEffectDispatcher<Q>,
    bus: B,
    payments: Option<Arc<dyn PaymentGateway>>,
    config: EngineConfig,
}

impl<S, Q, B> CreditLedger<S, Q, B>
where
    S: LedgerStore,
    Q: JobStore,
    B: EventBus<EventEnvelope<LedgerEvent>>,
{
    pub fn new(store: S, jobs: Q, bus: B, config: EngineConfig) -> Self {
        Self {
            store,
            side_effects: SideEffectDispatcher::new(jobs, &config),
            bus,
            payments: None,
            config,
        }
    }

    pub fn with_payment_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.payments = Some(gateway);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn jobs(&self) -> &Q {
        self.side_effects.jobs()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- creation / completion ----------------------------------------

    /// Record a pending movement (with its reward distributions), then attempt
    /// completion straight away.
    #[instrument(skip(self, request), fields(quantity = request.quantity_of_credits), err)]
    pub fn create(&self, request: NewMovement) -> EngineResult<CreditMovement> {
        let opened = self.open(request)?;
        self.complete(opened.movement.id_typed())
    }

    fn open(&self, request: NewMovement) -> EngineResult<Committed> {
        let cmd = OpenMovement {
            movement_id: MovementId::new(),
            payer: request.payer,
            payee: request.payee,
            quantity_of_credits: request.quantity_of_credits,
            metadata: request.metadata,
            comments: request.comments,
            occurred_at: Utc::now(),
        };

        let committed = self.store.transaction(|tx| {
            let opened = open_in(tx, &cmd)?;
            for distribution in request.rewards.distribute(&opened.movement)? {
                tx.insert_distribution(distribution)?;
            }
            Ok(opened)
        })?;

        info!(
            movement_id = %committed.movement.id_typed(),
            payer = %committed.movement.payer(),
            payee = %committed.movement.payee(),
            "movement opened"
        );
        self.publish(&committed);
        Ok(committed)
    }

    /// Attempt the `pending -> completed` transition.
    ///
    /// A pledge whose payer lacks the credits stays pending without error.
    /// Either way both holders' balances are recomputed afterwards.
    #[instrument(skip(self), fields(movement_id = %id), err)]
    pub fn complete(&self, id: MovementId) -> EngineResult<CreditMovement> {
        let now = Utc::now();
        let committed = self.store.transaction(|tx| complete_in(tx, id, now))?;

        if committed.completed() {
            info!(movement_id = %id, pledge = committed.movement.is_pledge(), "movement completed");
        } else if committed.movement.is_pending() {
            debug!(movement_id = %id, "completion stalled; movement stays pending");
        }

        let movement = committed.movement.clone();
        self.after_commit(&committed, &[movement.payer(), movement.payee()]);
        Ok(movement)
    }

    /// Re-attempt every stalled pledge paid by `holder`, oldest first.
    /// Returns the movements that completed.
    #[instrument(skip(self), fields(holder = %holder), err)]
    pub fn reevaluate_pending(&self, holder: Holder) -> EngineResult<Vec<CreditMovement>> {
        let query = MovementQuery::paid_by(holder).pending().to_projects().not_refunded();
        let stalled = self.store.read(|tx| tx.movements(&query))?;

        let mut completed = Vec::new();
        for movement in stalled.iter().filter(|m| m.payment_failure().is_none()) {
            let after = self.complete(movement.id_typed())?;
            if after.is_completed() {
                completed.push(after);
            }
        }
        Ok(completed)
    }

    // ---- balances ------------------------------------------------------

    /// Recompute and store `holder`'s balance from persisted movements.
    pub fn recompute(&self, holder: Holder) -> EngineResult<BalanceRecord> {
        let (_, record) = self.refresh_balance(holder)?;
        Ok(record)
    }

    /// Stored balance record, if one was ever computed.
    pub fn balance(&self, holder: &Holder) -> EngineResult<Option<BalanceRecord>> {
        self.store.read(|tx| tx.balance(holder))
    }

    /// Stored balance, 0 for a holder that has none yet.
    pub fn current_balance(&self, holder: &Holder) -> EngineResult<i64> {
        Ok(self.balance(holder)?.map_or(0, |b| b.current()))
    }

    fn refresh_balance(&self, holder: Holder) -> EngineResult<(i64, BalanceRecord)> {
        let now = Utc::now();
        self.store.transaction(|tx| {
            let before = tx.balance(&holder)?.map_or(0, |b| b.current());
            let record = tx.recompute_balance(holder, now)?;
            Ok((before, record))
        })
    }

    // ---- refunds / destruction ----------------------------------------

    /// Reverse a movement with a compensating one.
    ///
    /// One atomic unit: discard the reward distributions, create and complete
    /// the swapped movement, link it from the original, and remove the
    /// payer's funding activities for the payee.
    ///
    /// The original need not be completed. Refunding a pledge that is still
    /// pending completes the compensating movement anyway, so the backer is
    /// credited for credits that were never debited.
    #[instrument(skip(self, initiated_by), fields(movement_id = %id, initiated_by = %initiated_by.name), err)]
    pub fn refund(&self, id: MovementId, initiated_by: &Actor) -> EngineResult<CreditMovement> {
        let now = Utc::now();

        let (original, refund) = self.store.transaction(|tx| {
            let mut original = tx.movement(id)?.ok_or_else(DomainError::not_found)?;
            let refund_id = MovementId::new();
            let record = MovementCommand::RecordRefund(RecordRefund {
                movement_id: id,
                refund_id,
                initiated_by: initiated_by.clone(),
                occurred_at: now,
            });
            // Rejects a second refund before anything is written.
            original.handle(&record)?;

            let discarded = tx.delete_distributions(id)?;
            debug!(movement_id = %id, discarded, "reward distributions discarded");

            let opened = open_in(
                tx,
                &OpenMovement {
                    movement_id: refund_id,
                    payer: Some(original.payee()),
                    payee: Some(original.payer()),
                    quantity_of_credits: original.quantity_of_credits(),
                    metadata: Metadata::new(),
                    comments: Some(format!("Refund created by {}", initiated_by.name)),
                    occurred_at: now,
                },
            )?;
            let completed = complete_in(tx, refund_id, now)?;
            let refund = Committed {
                movement: completed.movement,
                from_version: opened.from_version,
                events: opened.events.into_iter().chain(completed.events).collect(),
            };

            let from_version = original.version();
            let events = execute(&mut original, &record)?;
            tx.update_movement(original.clone(), ExpectedVersion::Exact(from_version))?;

            let removed = tx.delete_funding_activities(original.payer().id, &original.payee())?;
            debug!(movement_id = %id, removed, "funding activities removed");

            Ok((
                Committed {
                    movement: original,
                    from_version,
                    events,
                },
                refund,
            ))
        })?;

        info!(
            movement_id = %id,
            refund_id = %refund.movement.id_typed(),
            quantity = original.movement.quantity_of_credits(),
            "movement refunded"
        );

        let holders = [original.movement.payer(), original.movement.payee()];
        self.after_commit(&refund, &holders);
        self.after_commit(&original, &[]);
        Ok(refund.movement)
    }

    /// Delete a movement and its reward distributions, then recompute both
    /// holders.
    #[instrument(skip(self), fields(movement_id = %id), err)]
    pub fn destroy(&self, id: MovementId) -> EngineResult<CreditMovement> {
        let removed = self.store.transaction(|tx| {
            let movement = tx.delete_movement(id)?.ok_or_else(DomainError::not_found)?;
            tx.delete_distributions(id)?;
            Ok(movement)
        })?;

        info!(movement_id = %id, "movement destroyed");
        self.after_commit(
            &Committed::unchanged(removed.clone()),
            &[removed.payer(), removed.payee()],
        );
        Ok(removed)
    }

    // ---- purchases -----------------------------------------------------

    /// Buy credits with a card: a transaction-origin holder pays `buyer`.
    ///
    /// A declined card leaves the movement pending with its failure message and
    /// reports it as `PurchaseOutcome::Declined`.
    #[instrument(skip(self, card), fields(buyer = %buyer, quantity = quantity_of_credits), err)]
    pub fn purchase_credits(
        &self,
        buyer: HolderId,
        quantity_of_credits: i64,
        card: CardDetails,
    ) -> EngineResult<PurchaseOutcome> {
        let gateway = self
            .payments
            .clone()
            .ok_or_else(|| DomainError::collaborator("no payment gateway configured"))?;
        card.validate()?;

        let mut metadata = Metadata::new();
        metadata.insert("card_type".to_string(), json!(card.card_type()));
        let opened = self.open(NewMovement {
            metadata,
            ..NewMovement::new(
                Holder::transaction(HolderId::new()),
                Holder::user(buyer),
                quantity_of_credits,
            )
        })?;
        let id = opened.movement.id_typed();

        let request = ChargeRequest {
            movement_id: id,
            buyer,
            quantity_of_credits,
            card,
        };

        match gateway.charge(&request) {
            Ok(ChargeOutcome::Approved { authorization }) => {
                let movement = self.complete(id)?;
                Ok(PurchaseOutcome::Approved {
                    movement,
                    authorization,
                })
            }
            Ok(ChargeOutcome::Declined { message }) => {
                warn!(movement_id = %id, message = %message, "card declined");
                let movement = self.record_payment_failure(id, &message)?;
                Ok(PurchaseOutcome::Declined {
                    movement,
                    error: DomainError::validation(message),
                })
            }
            Err(err) => {
                warn!(movement_id = %id, error = %err, "payment gateway failed");
                self.record_payment_failure(id, &err.to_string())?;
                Err(EngineError::from(err))
            }
        }
    }

    fn record_payment_failure(&self, id: MovementId, message: &str) -> EngineResult<CreditMovement> {
        let now = Utc::now();
        let committed = self.store.transaction(|tx| {
            let mut movement = tx.movement(id)?.ok_or_else(DomainError::not_found)?;
            let from_version = movement.version();
            let cmd = MovementCommand::RecordPaymentFailure(RecordPaymentFailure {
                movement_id: id,
                message: message.to_string(),
                occurred_at: now,
            });
            let events = execute(&mut movement, &cmd)?;
            if !events.is_empty() {
                tx.update_movement(movement.clone(), ExpectedVersion::Exact(from_version))?;
            }
            Ok(Committed {
                movement,
                from_version,
                events,
            })
        })?;

        self.publish(&committed);
        Ok(committed.movement)
    }

    // ---- reads ---------------------------------------------------------

    pub fn movement(&self, id: MovementId) -> EngineResult<Option<CreditMovement>> {
        self.store.read(|tx| tx.movement(id))
    }

    pub fn movements(&self, query: &MovementQuery) -> EngineResult<Vec<CreditMovement>> {
        self.store.read(|tx| tx.movements(query))
    }

    pub fn distributions(&self, id: MovementId) -> EngineResult<Vec<RewardDistribution>> {
        self.store.read(|tx| tx.distributions(id))
    }

    pub fn activities(&self, actor: HolderId, target: &Holder) -> EngineResult<Vec<Activity>> {
        self.store.read(|tx| tx.activities(actor, target))
    }

    // ---- post-commit ---------------------------------------------------

    /// The unit of work is already committed: failures here are logged and
    /// never stop the remaining steps.
    fn after_commit(&self, committed: &Committed, holders: &[Holder]) {
        let mut raised = Vec::new();
        for holder in holders.iter().filter(|h| h.is_balance_bearing()) {
            match self.refresh_balance(*holder) {
                Ok((before, record)) => {
                    debug!(holder = %holder, before, after = record.current(), "balance recomputed");
                    if record.current() > before && holder.kind.can_pledge() {
                        raised.push(*holder);
                    }
                }
                Err(e) => warn!(
                    movement_id = %committed.movement.id_typed(),
                    holder = %holder,
                    error = %e,
                    "failed to recompute balance"
                ),
            }
        }

        self.publish(committed);

        let now = Utc::now();
        for envelope in committed.envelopes() {
            if let Err(e) = self.side_effects.dispatch(&envelope, now) {
                warn!(
                    movement_id = %committed.movement.id_typed(),
                    event_type = envelope.event_type(),
                    error = %e,
                    "failed to schedule side effects"
                );
            }
        }

        if self.config.reevaluate_stalled_pledges {
            for holder in raised {
                match self.reevaluate_pending(holder) {
                    Ok(completed) if !completed.is_empty() => {
                        info!(holder = %holder, count = completed.len(), "stalled pledges completed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(holder = %holder, error = %e, "failed to re-evaluate stalled pledges"),
                }
            }
        }
    }

    fn publish(&self, committed: &Committed) {
        for envelope in committed.envelopes() {
            let event_type = envelope.event_type().to_string();
            if let Err(e) = self.bus.publish(envelope) {
                warn!(
                    movement_id = %committed.movement.id_typed(),
                    event_type = %event_type,
                    error = ?e,
                    "failed to publish ledger event"
                );
            }
        }
    }
}

/// Validate and insert a new pending movement.
fn open_in(tx: &mut dyn LedgerTx, cmd: &OpenMovement) -> EngineResult<Committed> {
    let event = cmd.decide()?;
    let movement = CreditMovement::opened(&event);
    tx.insert_movement(movement.clone())?;
    Ok(Committed {
        movement,
        from_version: 0,
        events: vec![LedgerEvent::Opened(event)],
    })
}

/// Run the completion guard against the payer's balance as derived from the
/// movements visible in `tx`, and persist the transition if it fires.
fn complete_in(tx: &mut dyn LedgerTx, id: MovementId, now: DateTime<Utc>) -> EngineResult<Committed> {
    let mut movement = tx.movement(id)?.ok_or_else(DomainError::not_found)?;
    let from_version = movement.version();

    let payer = movement.payer();
    let payer_balance = if movement.is_pledge() {
        let history = tx.movements(&MovementQuery::touching(payer).completed())?;
        BalanceRecord::derive(payer, &history, now)?.current()
    } else {
        0
    };

    let cmd = MovementCommand::Complete(CompleteMovement {
        movement_id: id,
        payer_balance,
        occurred_at: now,
    });
    let events = execute(&mut movement, &cmd)?;
    if events.is_empty() {
        return Ok(Committed::unchanged(movement));
    }

    tx.update_movement(movement.clone(), ExpectedVersion::Exact(from_version))?;

    // A completion that would push either side past i64 is rolled back.
    for holder in [movement.payer(), movement.payee()] {
        if holder.is_balance_bearing() {
            let history = tx.movements(&MovementQuery::touching(holder).completed())?;
            BalanceRecord::derive(holder, &history, now)?;
        }
    }

    if movement.is_pledge() {
        for mut distribution in tx.distributions(id)? {
            if distribution.complete(now) {
                tx.update_distribution(distribution)?;
            }
        }
    }

    Ok(Committed {
        movement,
        from_version,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledgebank_events::InMemoryEventBus;

    use crate::jobs::InMemoryJobStore;
    use crate::store::InMemoryLedgerStore;

    type TestLedger =
        CreditLedger<Arc<InMemoryLedgerStore>, Arc<InMemoryJobStore>, Arc<InMemoryEventBus<EventEnvelope<LedgerEvent>>>>;

    fn ledger() -> TestLedger {
        CreditLedger::new(
            InMemoryLedgerStore::arc(),
            InMemoryJobStore::arc(),
            Arc::new(InMemoryEventBus::new()),
            EngineConfig::default(),
        )
    }

    fn fund(ledger: &TestLedger, user: Holder, credits: i64) {
        ledger
            .create(NewMovement::new(Holder::adjustment(HolderId::new()), user, credits))
            .unwrap();
    }

    #[test]
    fn missing_payer_is_a_validation_error() {
        let ledger = ledger();
        let err = ledger
            .create(NewMovement {
                payee: Some(Holder::project(HolderId::new())),
                quantity_of_credits: 5,
                ..NewMovement::default()
            })
            .unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Validation(_))));
        assert!(ledger.movements(&MovementQuery::all()).unwrap().is_empty());
    }

    #[test]
    fn stalled_pledge_creates_balances_lazily() {
        let ledger = ledger();
        let user = Holder::user(HolderId::new());
        let project = Holder::project(HolderId::new());

        let pledge = ledger.create(NewMovement::new(user, project, 10)).unwrap();

        assert!(pledge.is_pending());
        assert_eq!(ledger.balance(&user).unwrap().map(|b| b.current()), Some(0));
        assert_eq!(ledger.balance(&project).unwrap().map(|b| b.current()), Some(0));
    }

    #[test]
    fn adjustment_balances_are_never_stored() {
        let ledger = ledger();
        let adjustment = Holder::adjustment(HolderId::new());
        let user = Holder::user(HolderId::new());

        ledger.create(NewMovement::new(adjustment, user, 25)).unwrap();

        assert!(ledger.balance(&adjustment).unwrap().is_none());
        assert_eq!(ledger.current_balance(&user).unwrap(), 25);
    }

    #[test]
    fn completing_again_is_a_no_op() {
        let ledger = ledger();
        let user = Holder::user(HolderId::new());
        fund(&ledger, user, 50);
        let pledge = ledger
            .create(NewMovement::new(user, Holder::project(HolderId::new()), 20))
            .unwrap();
        let jobs_before = ledger.jobs().stats().unwrap().pending;

        let again = ledger.complete(pledge.id_typed()).unwrap();

        assert_eq!(again.version(), pledge.version());
        assert_eq!(ledger.jobs().stats().unwrap().pending, jobs_before);
        assert_eq!(ledger.current_balance(&user).unwrap(), 30);
    }

    #[test]
    fn unknown_movement_is_not_found() {
        let ledger = ledger();
        let err = ledger.complete(MovementId::new()).unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::NotFound));
        assert_eq!(
            ledger.destroy(MovementId::new()).unwrap_err().domain(),
            Some(&DomainError::NotFound)
        );
    }

    #[test]
    fn purchase_without_gateway_is_a_collaborator_failure() {
        let ledger = ledger();
        let card = CardDetails {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            number: "4111111111111111".to_string(),
            ccv: "123".to_string(),
            expire_month: 1,
            expire_year: 2031,
            country: "GB".to_string(),
        };
        let err = ledger.purchase_credits(HolderId::new(), 10, card).unwrap_err();
        assert!(matches!(err.domain(), Some(DomainError::Collaborator(_))));
    }

    #[test]
    fn events_are_published_with_increasing_sequence_numbers() {
        let ledger = ledger();
        let subscription = ledger.bus.subscribe();
        let user = Holder::user(HolderId::new());

        fund(&ledger, user, 10);

        let envelopes = subscription.drain();
        let types: Vec<_> = envelopes.iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(types, vec!["ledger.movement.opened", "ledger.movement.completed"]);
        assert_eq!(envelopes[0].sequence_number(), 1);
        assert_eq!(envelopes[1].sequence_number(), 2);
        assert_eq!(envelopes[0].aggregate_type(), MOVEMENT_AGGREGATE);
    }
}
