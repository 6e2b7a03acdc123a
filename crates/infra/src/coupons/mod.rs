//! Coupon allocation pools.
//!
//! `allocate` is the critical section: two callers racing on the same coupon
//! must never receive the same code, and when one code is left exactly one of
//! them wins. The in-memory pool serializes claims per coupon; the Postgres
//! pool claims with a single conditional `UPDATE`.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryCouponPool;
pub use postgres::PostgresCouponPool;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use pledgebank_core::{CouponId, HolderId};
use pledgebank_coupons::{Coupon, CouponCode};

use crate::error::EngineResult;

/// Blocking coupon pool.
pub trait CouponPool: Send + Sync {
    /// Register a campaign. Names are unique.
    fn create_coupon(&self, campaign_name: &str, project: Option<HolderId>) -> EngineResult<Coupon>;

    /// Add codes to a campaign's pool. Codes are unique across all campaigns.
    fn provision_codes(&self, coupon: CouponId, codes: &[String]) -> EngineResult<usize>;

    fn find_by_campaign(&self, campaign_name: &str) -> EngineResult<Option<Coupon>>;

    /// Claim one unallocated code, stamping it with the current time and
    /// `metadata`. `Exhausted` when none is left; `NotFound` for an unknown coupon.
    fn allocate(&self, coupon: CouponId, metadata: Option<JsonValue>) -> EngineResult<String>;

    fn remaining(&self, coupon: CouponId) -> EngineResult<usize>;

    /// Codes already handed out, oldest allocation first.
    fn allocated(&self, coupon: CouponId) -> EngineResult<Vec<CouponCode>>;
}

impl<P: CouponPool + ?Sized> CouponPool for Arc<P> {
    fn create_coupon(&self, campaign_name: &str, project: Option<HolderId>) -> EngineResult<Coupon> {
        (**self).create_coupon(campaign_name, project)
    }

    fn provision_codes(&self, coupon: CouponId, codes: &[String]) -> EngineResult<usize> {
        (**self).provision_codes(coupon, codes)
    }

    fn find_by_campaign(&self, campaign_name: &str) -> EngineResult<Option<Coupon>> {
        (**self).find_by_campaign(campaign_name)
    }

    fn allocate(&self, coupon: CouponId, metadata: Option<JsonValue>) -> EngineResult<String> {
        (**self).allocate(coupon, metadata)
    }

    fn remaining(&self, coupon: CouponId) -> EngineResult<usize> {
        (**self).remaining(coupon)
    }

    fn allocated(&self, coupon: CouponId) -> EngineResult<Vec<CouponCode>> {
        (**self).allocated(coupon)
    }
}

/// Async coupon pool for database-backed implementations.
#[async_trait::async_trait]
pub trait AsyncCouponPool: Send + Sync {
    async fn create_coupon(&self, campaign_name: &str, project: Option<HolderId>) -> EngineResult<Coupon>;

    async fn provision_codes(&self, coupon: CouponId, codes: &[String]) -> EngineResult<usize>;

    async fn find_by_campaign(&self, campaign_name: &str) -> EngineResult<Option<Coupon>>;

    async fn allocate(&self, coupon: CouponId, metadata: Option<JsonValue>) -> EngineResult<String>;

    async fn remaining(&self, coupon: CouponId) -> EngineResult<usize>;

    async fn allocated(&self, coupon: CouponId) -> EngineResult<Vec<CouponCode>>;
}
