//! Infrastructure layer: ledger storage, coupon pools, the deferred job
//! queue, external collaborators and the `CreditLedger` service that ties
//! them together.

pub mod collaborators;
pub mod config;
pub mod coupons;
pub mod error;
pub mod jobs;
pub mod ledger_service;
pub mod side_effects;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use ledger_service::{CreditLedger, NewMovement, PurchaseOutcome};
