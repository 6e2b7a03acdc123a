//! In-memory ledger store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use pledgebank_core::{AggregateRoot, DistributionId, DomainError, ExpectedVersion, HolderId, MovementId};
use pledgebank_ledger::{Activity, BalanceRecord, CreditMovement, Holder, RewardDistribution};

use super::{LedgerStore, LedgerTx, MovementQuery};
use crate::error::{EngineResult, poisoned};

#[derive(Debug, Clone, Default)]
struct Tables {
    movements: HashMap<MovementId, CreditMovement>,
    balances: HashMap<Holder, BalanceRecord>,
    distributions: HashMap<DistributionId, RewardDistribution>,
    activities: Vec<Activity>,
}

/// In-memory ledger store.
///
/// Transactions are serialized behind a single mutex and run against a copy
/// of the tables; the copy replaces the live tables only when the closure
/// returns `Ok`.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn transaction<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&mut dyn LedgerTx) -> EngineResult<T>,
    {
        let mut live = self.tables.lock().map_err(poisoned)?;
        let mut staged = live.clone();
        let out = f(&mut staged)?;
        *live = staged;
        Ok(out)
    }

    fn read<T, F>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&dyn LedgerTx) -> EngineResult<T>,
    {
        let live = self.tables.lock().map_err(poisoned)?;
        f(&*live)
    }
}

impl LedgerTx for Tables {
    fn movement(&self, id: MovementId) -> EngineResult<Option<CreditMovement>> {
        Ok(self.movements.get(&id).cloned())
    }

    fn movements(&self, query: &MovementQuery) -> EngineResult<Vec<CreditMovement>> {
        let mut out: Vec<_> = self
            .movements
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.created_at(), m.id_typed()));
        Ok(out)
    }

    fn insert_movement(&mut self, movement: CreditMovement) -> EngineResult<()> {
        let id = movement.id_typed();
        if self.movements.contains_key(&id) {
            return Err(DomainError::conflict(format!("movement {id} already exists")).into());
        }
        self.movements.insert(id, movement);
        Ok(())
    }

    fn update_movement(
        &mut self,
        movement: CreditMovement,
        expected: ExpectedVersion,
    ) -> EngineResult<()> {
        let id = movement.id_typed();
        let slot = self.movements.get_mut(&id).ok_or_else(DomainError::not_found)?;
        expected.check(slot.version())?;
        *slot = movement;
        Ok(())
    }

    fn delete_movement(&mut self, id: MovementId) -> EngineResult<Option<CreditMovement>> {
        Ok(self.movements.remove(&id))
    }

    fn balance(&self, holder: &Holder) -> EngineResult<Option<BalanceRecord>> {
        Ok(self.balances.get(holder).cloned())
    }

    fn recompute_balance(&mut self, holder: Holder, at: DateTime<Utc>) -> EngineResult<BalanceRecord> {
        let record = BalanceRecord::derive(
            holder,
            self.movements.values().filter(|m| m.touches(&holder)),
            at,
        )?;
        self.balances.insert(holder, record.clone());
        Ok(record)
    }

    fn distributions(&self, movement: MovementId) -> EngineResult<Vec<RewardDistribution>> {
        let mut out: Vec<_> = self
            .distributions
            .values()
            .filter(|d| d.movement_id == movement)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.id);
        Ok(out)
    }

    fn insert_distribution(&mut self, distribution: RewardDistribution) -> EngineResult<()> {
        if self.distributions.contains_key(&distribution.id) {
            return Err(DomainError::conflict(format!(
                "distribution {} already exists",
                distribution.id
            ))
            .into());
        }
        self.distributions.insert(distribution.id, distribution);
        Ok(())
    }

    fn update_distribution(&mut self, distribution: RewardDistribution) -> EngineResult<()> {
        let slot = self
            .distributions
            .get_mut(&distribution.id)
            .ok_or_else(DomainError::not_found)?;
        *slot = distribution;
        Ok(())
    }

    fn delete_distributions(&mut self, movement: MovementId) -> EngineResult<usize> {
        let before = self.distributions.len();
        self.distributions.retain(|_, d| d.movement_id != movement);
        Ok(before - self.distributions.len())
    }

    fn insert_activity(&mut self, activity: Activity) -> EngineResult<()> {
        self.activities.push(activity);
        Ok(())
    }

    fn activities(&self, actor: HolderId, target: &Holder) -> EngineResult<Vec<Activity>> {
        Ok(self
            .activities
            .iter()
            .filter(|a| a.actor == actor && a.target == *target)
            .cloned()
            .collect())
    }

    fn delete_funding_activities(&mut self, actor: HolderId, target: &Holder) -> EngineResult<usize> {
        let before = self.activities.len();
        self.activities.retain(|a| !a.is_funding_of(actor, target));
        Ok(before - self.activities.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledgebank_ledger::{Metadata, OpenMovement};

    fn pending(payer: Holder, payee: Holder, quantity: i64) -> CreditMovement {
        let opened = OpenMovement {
            movement_id: MovementId::new(),
            payer: Some(payer),
            payee: Some(payee),
            quantity_of_credits: quantity,
            metadata: Metadata::new(),
            comments: None,
            occurred_at: Utc::now(),
        }
        .decide()
        .unwrap();
        CreditMovement::opened(&opened)
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        let movement = pending(Holder::user(HolderId::new()), Holder::project(HolderId::new()), 5);
        let id = movement.id_typed();

        let result: EngineResult<()> = store.transaction(|tx| {
            tx.insert_movement(movement.clone())?;
            Err(DomainError::invariant("abort").into())
        });

        assert!(result.is_err());
        assert!(store.read(|tx| tx.movement(id)).unwrap().is_none());
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let store = InMemoryLedgerStore::new();
        let movement = pending(Holder::user(HolderId::new()), Holder::project(HolderId::new()), 5);
        store.transaction(|tx| tx.insert_movement(movement.clone())).unwrap();

        let err = store
            .transaction(|tx| tx.update_movement(movement.clone(), ExpectedVersion::Exact(7)))
            .unwrap_err();

        assert!(matches!(err.domain(), Some(DomainError::Conflict(_))));
    }

    #[test]
    fn balances_are_created_lazily() {
        let store = InMemoryLedgerStore::new();
        let user = Holder::user(HolderId::new());

        assert!(store.read(|tx| tx.balance(&user)).unwrap().is_none());

        let record = store
            .transaction(|tx| tx.recompute_balance(user, Utc::now()))
            .unwrap();

        assert_eq!(record.current(), 0);
        assert_eq!(store.read(|tx| tx.balance(&user)).unwrap(), Some(record));
    }

    #[test]
    fn query_scopes_filter_and_order() {
        let store = InMemoryLedgerStore::new();
        let user = Holder::user(HolderId::new());
        let project = Holder::project(HolderId::new());
        let purchase = pending(Holder::transaction(HolderId::new()), user, 10);
        let pledge = pending(user, project, 3);

        store
            .transaction(|tx| {
                tx.insert_movement(purchase.clone())?;
                tx.insert_movement(pledge.clone())
            })
            .unwrap();

        let found = |q: MovementQuery| store.read(move |tx| tx.movements(&q)).unwrap();

        assert_eq!(found(MovementQuery::all().from_transactions()), vec![purchase.clone()]);
        assert_eq!(found(MovementQuery::all().from_users().to_projects()), vec![pledge.clone()]);
        assert_eq!(found(MovementQuery::touching(user)).len(), 2);
        assert!(found(MovementQuery::touching(user).completed()).is_empty());
        assert_eq!(found(MovementQuery::paid_by(user).pending().not_refunded()), vec![pledge]);
    }
}
