//! In-memory coupon pool with per-coupon locking.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument};

use pledgebank_core::{CouponId, DomainError, HolderId};
use pledgebank_coupons::{Coupon, CouponCode};

use super::CouponPool;
use crate::error::{EngineResult, poisoned};

#[derive(Debug)]
struct Campaign {
    coupon: Coupon,
    /// Provisioning order; allocation hands out the oldest free code first.
    codes: Mutex<Vec<CouponCode>>,
}

/// In-memory pool.
///
/// The campaign map is only write-locked to add campaigns; each campaign's
/// codes sit behind their own mutex, so claims on different coupons never
/// contend.
#[derive(Debug, Default)]
pub struct InMemoryCouponPool {
    campaigns: RwLock<HashMap<CouponId, Arc<Campaign>>>,
    /// Every code string ever provisioned, across campaigns.
    known_codes: Mutex<HashSet<String>>,
}

impl InMemoryCouponPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn campaign(&self, coupon: CouponId) -> EngineResult<Arc<Campaign>> {
        let campaigns = self.campaigns.read().map_err(poisoned)?;
        campaigns
            .get(&coupon)
            .cloned()
            .ok_or_else(|| DomainError::not_found().into())
    }
}

impl CouponPool for InMemoryCouponPool {
    fn create_coupon(&self, campaign_name: &str, project: Option<HolderId>) -> EngineResult<Coupon> {
        let coupon = Coupon::new(campaign_name, project)?;

        let mut campaigns = self.campaigns.write().map_err(poisoned)?;
        if campaigns
            .values()
            .any(|c| c.coupon.campaign_name() == coupon.campaign_name())
        {
            return Err(DomainError::validation("campaign_name has already been taken").into());
        }

        campaigns.insert(
            coupon.id(),
            Arc::new(Campaign {
                coupon: coupon.clone(),
                codes: Mutex::new(Vec::new()),
            }),
        );
        info!(coupon_id = %coupon.id(), campaign = coupon.campaign_name(), "coupon created");
        Ok(coupon)
    }

    fn provision_codes(&self, coupon: CouponId, codes: &[String]) -> EngineResult<usize> {
        let campaign = self.campaign(coupon)?;
        let new_codes = codes
            .iter()
            .map(|code| CouponCode::new(coupon, code.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut known = self.known_codes.lock().map_err(poisoned)?;
        let mut batch = HashSet::new();
        for code in &new_codes {
            if known.contains(code.code()) || !batch.insert(code.code()) {
                return Err(DomainError::validation(format!(
                    "code '{}' has already been taken",
                    code.code()
                ))
                .into());
            }
        }

        let mut pool = campaign.codes.lock().map_err(poisoned)?;
        known.extend(new_codes.iter().map(|c| c.code().to_string()));
        let added = new_codes.len();
        pool.extend(new_codes);
        Ok(added)
    }

    fn find_by_campaign(&self, campaign_name: &str) -> EngineResult<Option<Coupon>> {
        let campaigns = self.campaigns.read().map_err(poisoned)?;
        Ok(campaigns
            .values()
            .find(|c| c.coupon.campaign_name() == campaign_name)
            .map(|c| c.coupon.clone()))
    }

    #[instrument(skip(self, metadata), fields(coupon_id = %coupon))]
    fn allocate(&self, coupon: CouponId, metadata: Option<JsonValue>) -> EngineResult<String> {
        let campaign = self.campaign(coupon)?;
        let mut pool = campaign.codes.lock().map_err(poisoned)?;

        let Some(code) = pool.iter_mut().find(|c| !c.is_allocated()) else {
            debug!(campaign = campaign.coupon.campaign_name(), "coupon exhausted");
            return Err(DomainError::exhausted(campaign.coupon.campaign_name()).into());
        };

        code.allocate(Utc::now(), metadata)?;
        debug!(code_id = %code.id(), "code allocated");
        Ok(code.code().to_string())
    }

    fn remaining(&self, coupon: CouponId) -> EngineResult<usize> {
        let campaign = self.campaign(coupon)?;
        let pool = campaign.codes.lock().map_err(poisoned)?;
        Ok(pool.iter().filter(|c| !c.is_allocated()).count())
    }

    fn allocated(&self, coupon: CouponId) -> EngineResult<Vec<CouponCode>> {
        let campaign = self.campaign(coupon)?;
        let pool = campaign.codes.lock().map_err(poisoned)?;
        let mut out: Vec<_> = pool.iter().filter(|c| c.is_allocated()).cloned().collect();
        out.sort_by_key(|c| c.allocated_on());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allocates_each_code_once_then_exhausts() {
        let pool = InMemoryCouponPool::new();
        let coupon = pool.create_coupon("LAUNCH", None).unwrap();
        pool.provision_codes(coupon.id(), &codes(&["A", "B"])).unwrap();

        let first = pool.allocate(coupon.id(), Some(json!({"user": 1}))).unwrap();
        let second = pool.allocate(coupon.id(), None).unwrap();

        assert_ne!(first, second);
        assert_eq!(pool.remaining(coupon.id()).unwrap(), 0);
        let err = pool.allocate(coupon.id(), None).unwrap_err();
        assert!(err.is_exhausted());

        let allocated = pool.allocated(coupon.id()).unwrap();
        assert_eq!(allocated.len(), 2);
        assert!(allocated.iter().any(|c| c.metadata() == Some(&json!({"user": 1}))));
    }

    #[test]
    fn never_allocates_from_another_coupon() {
        let pool = InMemoryCouponPool::new();
        let empty = pool.create_coupon("EMPTY", None).unwrap();
        let full = pool.create_coupon("FULL", None).unwrap();
        pool.provision_codes(full.id(), &codes(&["F-1"])).unwrap();

        assert!(pool.allocate(empty.id(), None).unwrap_err().is_exhausted());
        assert_eq!(pool.remaining(full.id()).unwrap(), 1);
    }

    #[test]
    fn duplicate_names_and_codes_are_rejected() {
        let pool = InMemoryCouponPool::new();
        let a = pool.create_coupon("SPRING", None).unwrap();
        let b = pool.create_coupon("SUMMER", Some(HolderId::new())).unwrap();

        assert!(matches!(
            pool.create_coupon("SPRING", None).unwrap_err().domain(),
            Some(DomainError::Validation(_))
        ));

        pool.provision_codes(a.id(), &codes(&["X"])).unwrap();
        assert!(pool.provision_codes(b.id(), &codes(&["X"])).is_err());
        assert!(pool.provision_codes(b.id(), &codes(&["Y", "Y"])).is_err());
        assert_eq!(pool.remaining(b.id()).unwrap(), 0);
    }

    #[test]
    fn unknown_coupon_is_not_found() {
        let pool = InMemoryCouponPool::new();
        let err = pool.allocate(CouponId::new(), None).unwrap_err();
        assert_eq!(err.domain(), Some(&DomainError::NotFound));
    }

    #[test]
    fn lookup_by_campaign_name() {
        let pool = InMemoryCouponPool::new();
        let coupon = pool.create_coupon("AUTUMN", None).unwrap();

        assert_eq!(pool.find_by_campaign("AUTUMN").unwrap(), Some(coupon));
        assert_eq!(pool.find_by_campaign("WINTER").unwrap(), None);
    }
}
