//! Credit ledger domain: movements, their completion state machine, derived
//! balances, reward distributions and refund bookkeeping.
//!
//! Pure domain logic only: no IO, no persistence concerns.

pub mod activity;
pub mod balance;
pub mod holder;
pub mod movement;
pub mod reward;

pub use activity::{Activity, ActivityAction, Actor};
pub use balance::{BalanceRecord, credit_delta};
pub use holder::{Holder, HolderKind};
pub use movement::{
    CompleteMovement, CreditMovement, LedgerEvent, Metadata, MovementCommand, MovementCompleted,
    MovementOpened, MovementRefunded, MovementState, OpenMovement, PaymentFailed,
    RecordPaymentFailure, RecordRefund,
};
pub use reward::{DistributionStatus, RewardChoice, RewardDistribution, RewardSelection};
