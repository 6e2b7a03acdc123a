//! Ledger persistence: a unit-of-work over the movement, balance,
//! distribution and activity tables.
//!
//! Every write happens inside [`LedgerStore::transaction`]. The closure sees a
//! [`LedgerTx`]; if it returns `Err`, nothing it staged becomes visible.

mod in_memory;

pub use in_memory::InMemoryLedgerStore;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use pledgebank_core::{ExpectedVersion, HolderId, MovementId};
use pledgebank_ledger::{
    Activity, BalanceRecord, CreditMovement, Holder, HolderKind, MovementState, RewardDistribution,
};

use crate::error::EngineResult;

/// Filter over persisted movements. Results come back oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementQuery {
    pub touching: Option<Holder>,
    pub payer: Option<Holder>,
    pub state: Option<MovementState>,
    pub payer_kind: Option<HolderKind>,
    pub payee_kind: Option<HolderKind>,
    pub not_refunded: bool,
    pub created_since: Option<DateTime<Utc>>,
}

impl MovementQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Movements where `holder` is payer or payee.
    pub fn touching(holder: Holder) -> Self {
        Self {
            touching: Some(holder),
            ..Self::default()
        }
    }

    pub fn paid_by(holder: Holder) -> Self {
        Self {
            payer: Some(holder),
            ..Self::default()
        }
    }

    pub fn completed(mut self) -> Self {
        self.state = Some(MovementState::Completed);
        self
    }

    pub fn pending(mut self) -> Self {
        self.state = Some(MovementState::Pending);
        self
    }

    /// Credit purchases.
    pub fn from_transactions(mut self) -> Self {
        self.payer_kind = Some(HolderKind::Transaction);
        self
    }

    pub fn from_users(mut self) -> Self {
        self.payer_kind = Some(HolderKind::User);
        self
    }

    pub fn to_projects(mut self) -> Self {
        self.payee_kind = Some(HolderKind::Project);
        self
    }

    pub fn not_refunded(mut self) -> Self {
        self.not_refunded = true;
        self
    }

    pub fn created_since(mut self, at: DateTime<Utc>) -> Self {
        self.created_since = Some(at);
        self
    }

    pub fn matches(&self, m: &CreditMovement) -> bool {
        self.touching.is_none_or(|h| m.touches(&h))
            && self.payer.is_none_or(|h| m.payer() == h)
            && self.state.is_none_or(|s| m.state() == s)
            && self.payer_kind.is_none_or(|k| m.payer().kind == k)
            && self.payee_kind.is_none_or(|k| m.payee().kind == k)
            && (!self.not_refunded || !m.is_refunded())
            && self.created_since.is_none_or(|at| m.created_at() >= at)
    }
}

/// One open unit of work.
pub trait LedgerTx {
    fn movement(&self, id: MovementId) -> EngineResult<Option<CreditMovement>>;

    fn movements(&self, query: &MovementQuery) -> EngineResult<Vec<CreditMovement>>;

    /// Insert a new movement. An existing id is a `Conflict`.
    fn insert_movement(&mut self, movement: CreditMovement) -> EngineResult<()>;

    /// Replace a movement, checking the persisted version against `expected`.
    fn update_movement(
        &mut self,
        movement: CreditMovement,
        expected: ExpectedVersion,
    ) -> EngineResult<()>;

    fn delete_movement(&mut self, id: MovementId) -> EngineResult<Option<CreditMovement>>;

    fn balance(&self, holder: &Holder) -> EngineResult<Option<BalanceRecord>>;

    /// Re-aggregate `holder`'s balance from the movements visible in this
    /// transaction and overwrite the stored record (creating it on first use).
    fn recompute_balance(&mut self, holder: Holder, at: DateTime<Utc>) -> EngineResult<BalanceRecord>;

    fn distributions(&self, movement: MovementId) -> EngineResult<Vec<RewardDistribution>>;

    fn insert_distribution(&mut self, distribution: RewardDistribution) -> EngineResult<()>;

    fn update_distribution(&mut self, distribution: RewardDistribution) -> EngineResult<()>;

    /// Remove every distribution of `movement`; returns how many went away.
    fn delete_distributions(&mut self, movement: MovementId) -> EngineResult<usize>;

    fn insert_activity(&mut self, activity: Activity) -> EngineResult<()>;

    fn activities(&self, actor: HolderId, target: &Holder) -> EngineResult<Vec<Activity>>;

    /// Remove every `Funded` activity for `(actor, target)`; returns the count.
    fn delete_funding_activities(&mut self, actor: HolderId, target: &Holder) -> EngineResult<usize>;
}

/// Transactional ledger storage.
pub trait LedgerStore: Send + Sync {
    /// Run `f` atomically. `Err` from `f` rolls back everything it wrote.
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> EngineResult<T>;

    /// Run `f` against a consistent read-only view.
    fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&dyn LedgerTx) -> EngineResult<T>;
}

impl<S: LedgerStore> LedgerStore for Arc<S> {
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> EngineResult<T>,
    {
        (**self).transaction(f)
    }

    fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&dyn LedgerTx) -> EngineResult<T>,
    {
        (**self).read(f)
    }
}
