//! Derived per-holder balances ("credit banks").

use chrono::{DateTime, Utc};
use pledgebank_core::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

use crate::holder::Holder;
use crate::movement::CreditMovement;

/// Signed effect of one movement on `holder`'s balance.
///
/// Only completed movements count. Incoming credits always count; outgoing
/// credits count only when they land on another balance-bearing holder.
pub fn credit_delta(holder: &Holder, movement: &CreditMovement) -> i64 {
    if !movement.is_completed() {
        return 0;
    }

    let quantity = movement.quantity_of_credits();
    if movement.payee() == *holder {
        quantity
    } else if movement.payer() == *holder && movement.payee().is_balance_bearing() {
        -quantity
    } else {
        0
    }
}

/// A holder's current credit total.
///
/// There is no setter: the only way to obtain a record is [`BalanceRecord::derive`],
/// which re-aggregates the full movement set every time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    holder: Holder,
    current: i64,
    updated_at: DateTime<Utc>,
}

impl BalanceRecord {
    /// Fails with `Validation` when the total does not fit in an `i64`.
    pub fn derive<'a, I>(holder: Holder, movements: I, at: DateTime<Utc>) -> DomainResult<Self>
    where
        I: IntoIterator<Item = &'a CreditMovement>,
    {
        let current = movements
            .into_iter()
            .try_fold(0i64, |total, m| total.checked_add(credit_delta(&holder, m)))
            .ok_or_else(|| DomainError::validation(format!("balance of {holder} overflows")))?;

        Ok(Self {
            holder,
            current,
            updated_at: at,
        })
    }

    pub fn holder(&self) -> Holder {
        self.holder
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{CompleteMovement, Metadata, MovementCommand, OpenMovement};
    use pledgebank_core::{HolderId, MovementId};
    use pledgebank_events::execute;
    use proptest::prelude::*;

    fn movement(payer: Holder, payee: Holder, quantity: i64, completed: bool) -> CreditMovement {
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
        let mut m = CreditMovement::opened(&opened);
        if completed {
            let cmd = MovementCommand::Complete(CompleteMovement {
                movement_id: m.id_typed(),
                payer_balance: i64::MAX,
                occurred_at: Utc::now(),
            });
            execute(&mut m, &cmd).unwrap();
        }
        m
    }

    #[test]
    fn purchase_then_pledge() {
        let user = Holder::user(HolderId::new());
        let project = Holder::project(HolderId::new());
        let movements = vec![
            movement(Holder::transaction(HolderId::new()), user, 100, true),
            movement(user, project, 40, true),
            movement(user, project, 500, false),
        ];

        let u = BalanceRecord::derive(user, &movements, Utc::now()).unwrap();
        let p = BalanceRecord::derive(project, &movements, Utc::now()).unwrap();

        assert_eq!(u.current(), 60);
        assert_eq!(p.current(), 40);
    }

    #[test]
    fn outgoing_to_non_balance_bearing_is_not_deducted() {
        let user = Holder::user(HolderId::new());
        let movements = vec![
            movement(Holder::adjustment(HolderId::new()), user, 10, true),
            movement(user, Holder::adjustment(HolderId::new()), 10, true),
        ];

        assert_eq!(BalanceRecord::derive(user, &movements, Utc::now()).unwrap().current(), 10);
    }

    #[test]
    fn holder_without_movements_is_zero() {
        let user = Holder::user(HolderId::new());
        let record = BalanceRecord::derive(user, std::iter::empty(), Utc::now()).unwrap();
        assert_eq!(record.current(), 0);
        assert_eq!(record.holder(), user);
    }

    #[test]
    fn overflowing_total_is_rejected() {
        let user = Holder::user(HolderId::new());
        let movements = vec![
            movement(Holder::adjustment(HolderId::new()), user, i64::MAX, true),
            movement(Holder::adjustment(HolderId::new()), user, 1, true),
        ];

        let err = BalanceRecord::derive(user, &movements, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(
            BalanceRecord::derive(user, &movements[..1], Utc::now()).unwrap().current(),
            i64::MAX
        );
    }

    #[derive(Debug, Clone)]
    struct Draft {
        payer: usize,
        payee: usize,
        quantity: i64,
        completed: bool,
    }

    fn draft() -> impl Strategy<Value = Draft> {
        (0usize..4, 0usize..4, 0i64..1_000, any::<bool>())
            .prop_filter("payer and payee differ", |(a, b, _, _)| a != b)
            .prop_map(|(payer, payee, quantity, completed)| Draft {
                payer,
                payee,
                quantity,
                completed,
            })
    }

    proptest! {
        #[test]
        fn derived_balance_matches_completed_sums(drafts in prop::collection::vec(draft(), 0..40)) {
            let holders = [
                Holder::user(HolderId::new()),
                Holder::user(HolderId::new()),
                Holder::project(HolderId::new()),
                Holder::transaction(HolderId::new()),
            ];
            let movements: Vec<_> = drafts
                .iter()
                .map(|s| movement(holders[s.payer], holders[s.payee], s.quantity, s.completed))
                .collect();

            for holder in holders.iter().filter(|h| h.is_balance_bearing()) {
                let incoming: i64 = drafts
                    .iter()
                    .filter(|s| s.completed && holders[s.payee] == *holder)
                    .map(|s| s.quantity)
                    .sum();
                let outgoing: i64 = drafts
                    .iter()
                    .filter(|s| {
                        s.completed
                            && holders[s.payer] == *holder
                            && holders[s.payee].is_balance_bearing()
                    })
                    .map(|s| s.quantity)
                    .sum();

                let record = BalanceRecord::derive(*holder, &movements, Utc::now()).unwrap();
                prop_assert_eq!(record.current(), incoming - outgoing);
            }
        }

        #[test]
        fn derivation_is_order_independent(drafts in prop::collection::vec(draft(), 0..20)) {
            let holders = [
                Holder::user(HolderId::new()),
                Holder::project(HolderId::new()),
                Holder::user(HolderId::new()),
                Holder::adjustment(HolderId::new()),
            ];
            let mut movements: Vec<_> = drafts
                .iter()
                .map(|s| movement(holders[s.payer], holders[s.payee], s.quantity, s.completed))
                .collect();

            let at = Utc::now();
            let forward = BalanceRecord::derive(holders[0], &movements, at).unwrap();
            movements.reverse();
            let backward = BalanceRecord::derive(holders[0], &movements, at).unwrap();
            prop_assert_eq!(forward, backward);
        }
    }
}
