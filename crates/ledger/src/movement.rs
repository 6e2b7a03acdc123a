use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pledgebank_core::{Aggregate, AggregateRoot, DomainError, DomainResult, MovementId};
use pledgebank_events::Event;

use crate::activity::Actor;
use crate::holder::Holder;

/// Opaque key/value data attached to a movement.
pub type Metadata = serde_json::Map<String, JsonValue>;

/// Lifecycle of a movement. `Completed` never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementState {
    Pending,
    Completed,
}

impl MovementState {
    pub fn as_str(self) -> &'static str {
        match self {
            MovementState::Pending => "pending",
            MovementState::Completed => "completed",
        }
    }
}

/// Aggregate root: one recorded transfer of credits between two holders.
///
/// Fields are private; every change goes through [`Aggregate::handle`] and
/// [`Aggregate::apply`] so the version always reflects the number of applied
/// events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditMovement {
    id: MovementId,
    payer: Holder,
    payee: Holder,
    quantity_of_credits: i64,
    state: MovementState,
    refunded_credit_movement_id: Option<MovementId>,
    payment_failure: Option<String>,
    metadata: Metadata,
    comments: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    version: u64,
}

impl CreditMovement {
    /// Materialize a movement from its opening event (version 1, pending).
    pub fn opened(event: &MovementOpened) -> Self {
        Self {
            id: event.movement_id,
            payer: event.payer,
            payee: event.payee,
            quantity_of_credits: event.quantity_of_credits,
            state: MovementState::Pending,
            refunded_credit_movement_id: None,
            payment_failure: None,
            metadata: event.metadata.clone(),
            comments: event.comments.clone(),
            created_at: event.occurred_at,
            completed_at: None,
            version: 1,
        }
    }

    pub fn id_typed(&self) -> MovementId {
        self.id
    }

    pub fn payer(&self) -> Holder {
        self.payer
    }

    pub fn payee(&self) -> Holder {
        self.payee
    }

    pub fn quantity_of_credits(&self) -> i64 {
        self.quantity_of_credits
    }

    pub fn state(&self) -> MovementState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        self.state == MovementState::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.state == MovementState::Pending
    }

    pub fn refunded_credit_movement_id(&self) -> Option<MovementId> {
        self.refunded_credit_movement_id
    }

    pub fn is_refunded(&self) -> bool {
        self.refunded_credit_movement_id.is_some()
    }

    /// Decline message recorded by the payment collaborator, if the charge failed.
    pub fn payment_failure(&self) -> Option<&str> {
        self.payment_failure.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn comments(&self) -> &str {
        &self.comments
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn touches(&self, holder: &Holder) -> bool {
        self.payer == *holder || self.payee == *holder
    }

    /// A user funding a project: the only movement subject to the funds guard.
    pub fn is_pledge(&self) -> bool {
        self.payer.kind.can_pledge() && self.payee.kind.is_project()
    }

    /// The pledge guard: a pledge may not complete while the payer holds fewer
    /// credits than it promises.
    pub fn lacks_credits_for_project(&self, payer_balance: i64) -> bool {
        self.is_pledge() && payer_balance < self.quantity_of_credits
    }

    /// The user side of the movement, if any.
    pub fn user(&self) -> Option<Holder> {
        [self.payer, self.payee].into_iter().find(|h| h.kind.can_pledge())
    }

    /// The project side of the movement, if any.
    pub fn project(&self) -> Option<Holder> {
        [self.payer, self.payee].into_iter().find(|h| h.kind.is_project())
    }

    /// The payer, when the movement is a pledge.
    pub fn owner(&self) -> Option<Holder> {
        self.is_pledge().then_some(self.payer)
    }
}

impl AggregateRoot for CreditMovement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: open a new movement (always starts pending).
///
/// `payer`/`payee` are optional so that an absent reference is reported as a
/// validation failure instead of being unrepresentable at the call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenMovement {
    pub movement_id: MovementId,
    pub payer: Option<Holder>,
    pub payee: Option<Holder>,
    pub quantity_of_credits: i64,
    pub metadata: Metadata,
    pub comments: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl OpenMovement {
    /// Validate the request and produce the opening event.
    pub fn decide(&self) -> DomainResult<MovementOpened> {
        let payer = self
            .payer
            .ok_or_else(|| DomainError::validation("payer must be set"))?;
        let payee = self
            .payee
            .ok_or_else(|| DomainError::validation("payee must be set"))?;

        if self.quantity_of_credits < 0 {
            return Err(DomainError::validation(
                "quantity_of_credits must be a non-negative number",
            ));
        }
        if payer == payee {
            return Err(DomainError::validation("payer and payee must be different holders"));
        }

        Ok(MovementOpened {
            movement_id: self.movement_id,
            payer,
            payee,
            quantity_of_credits: self.quantity_of_credits,
            metadata: self.metadata.clone(),
            comments: self.comments.clone().unwrap_or_default(),
            occurred_at: self.occurred_at,
        })
    }
}

/// Command: attempt the `pending -> completed` transition.
///
/// The caller supplies the payer's balance as freshly derived from persisted
/// movements; the aggregate itself never reads storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteMovement {
    pub movement_id: MovementId,
    pub payer_balance: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: link the compensating movement created by a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRefund {
    pub movement_id: MovementId,
    pub refund_id: MovementId,
    pub initiated_by: Actor,
    pub occurred_at: DateTime<Utc>,
}

/// Command: tag the movement with a declined payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPaymentFailure {
    pub movement_id: MovementId,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementCommand {
    Complete(CompleteMovement),
    RecordRefund(RecordRefund),
    RecordPaymentFailure(RecordPaymentFailure),
}

impl MovementCommand {
    pub fn target(&self) -> MovementId {
        match self {
            MovementCommand::Complete(c) => c.movement_id,
            MovementCommand::RecordRefund(c) => c.movement_id,
            MovementCommand::RecordPaymentFailure(c) => c.movement_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementOpened {
    pub movement_id: MovementId,
    pub payer: Holder,
    pub payee: Holder,
    pub quantity_of_credits: i64,
    pub metadata: Metadata,
    pub comments: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementCompleted {
    pub movement_id: MovementId,
    pub payer: Holder,
    pub payee: Holder,
    pub quantity_of_credits: i64,
    pub pledge: bool,
    pub metadata: Metadata,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRefunded {
    pub movement_id: MovementId,
    pub refund_id: MovementId,
    pub payer: Holder,
    pub payee: Holder,
    pub quantity_of_credits: i64,
    pub initiated_by: Actor,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub movement_id: MovementId,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Opened(MovementOpened),
    Completed(MovementCompleted),
    Refunded(MovementRefunded),
    PaymentFailed(PaymentFailed),
}

impl LedgerEvent {
    pub fn movement_id(&self) -> MovementId {
        match self {
            LedgerEvent::Opened(e) => e.movement_id,
            LedgerEvent::Completed(e) => e.movement_id,
            LedgerEvent::Refunded(e) => e.movement_id,
            LedgerEvent::PaymentFailed(e) => e.movement_id,
        }
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::Opened(_) => "ledger.movement.opened",
            LedgerEvent::Completed(_) => "ledger.movement.completed",
            LedgerEvent::Refunded(_) => "ledger.movement.refunded",
            LedgerEvent::PaymentFailed(_) => "ledger.movement.payment_failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::Opened(e) => e.occurred_at,
            LedgerEvent::Completed(e) => e.occurred_at,
            LedgerEvent::Refunded(e) => e.occurred_at,
            LedgerEvent::PaymentFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CreditMovement {
    type Command = MovementCommand;
    type Event = LedgerEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            LedgerEvent::Opened(e) => {
                let version = self.version;
                *self = CreditMovement::opened(e);
                self.version = version;
            }
            LedgerEvent::Completed(e) => {
                self.state = MovementState::Completed;
                self.completed_at = Some(e.occurred_at);
            }
            LedgerEvent::Refunded(e) => {
                self.refunded_credit_movement_id = Some(e.refund_id);
            }
            LedgerEvent::PaymentFailed(e) => {
                self.payment_failure = Some(e.message.clone());
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.target() != self.id {
            return Err(DomainError::invariant("command targets a different movement"));
        }

        match command {
            MovementCommand::Complete(cmd) => self.handle_complete(cmd),
            MovementCommand::RecordRefund(cmd) => self.handle_refund(cmd),
            MovementCommand::RecordPaymentFailure(cmd) => self.handle_payment_failure(cmd),
        }
    }
}

impl CreditMovement {
    fn handle_complete(&self, cmd: &CompleteMovement) -> DomainResult<Vec<LedgerEvent>> {
        // Completed and refunded movements are terminal; a declined charge blocks
        // completion for good.
        if self.is_completed() || self.is_refunded() || self.payment_failure.is_some() {
            return Ok(vec![]);
        }

        // Insufficient funds stalls the pledge silently: it stays pending.
        if self.lacks_credits_for_project(cmd.payer_balance) {
            return Ok(vec![]);
        }

        Ok(vec![LedgerEvent::Completed(MovementCompleted {
            movement_id: self.id,
            payer: self.payer,
            payee: self.payee,
            quantity_of_credits: self.quantity_of_credits,
            pledge: self.is_pledge(),
            metadata: self.metadata.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_refund(&self, cmd: &RecordRefund) -> DomainResult<Vec<LedgerEvent>> {
        if let Some(refund) = self.refunded_credit_movement_id {
            return Err(DomainError::AlreadyRefunded {
                movement: self.id,
                refund,
            });
        }
        if cmd.refund_id == self.id {
            return Err(DomainError::invariant("a movement cannot refund itself"));
        }

        Ok(vec![LedgerEvent::Refunded(MovementRefunded {
            movement_id: self.id,
            refund_id: cmd.refund_id,
            payer: self.payer,
            payee: self.payee,
            quantity_of_credits: self.quantity_of_credits,
            initiated_by: cmd.initiated_by.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_payment_failure(&self, cmd: &RecordPaymentFailure) -> DomainResult<Vec<LedgerEvent>> {
        if self.is_completed() {
            return Err(DomainError::invariant(
                "a completed movement cannot record a payment failure",
            ));
        }
        if self.payment_failure.is_some() {
            return Ok(vec![]);
        }

        Ok(vec![LedgerEvent::PaymentFailed(PaymentFailed {
            movement_id: self.id,
            message: cmd.message.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
