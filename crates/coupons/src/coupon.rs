use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pledgebank_core::{CouponCodeId, CouponId, DomainError, DomainResult, HolderId};

/// A named campaign owning a pool of single-use codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    id: CouponId,
    campaign_name: String,
    project: Option<HolderId>,
}

impl Coupon {
    /// Campaign names must be non-empty; uniqueness is enforced by the pool.
    pub fn new(campaign_name: impl Into<String>, project: Option<HolderId>) -> DomainResult<Self> {
        let campaign_name = campaign_name.into();
        if campaign_name.trim().is_empty() {
            return Err(DomainError::validation("campaign_name cannot be empty"));
        }

        Ok(Self {
            id: CouponId::new(),
            campaign_name,
            project,
        })
    }

    /// Rebuild a coupon from a persisted row.
    pub fn restore(id: CouponId, campaign_name: String, project: Option<HolderId>) -> Self {
        Self {
            id,
            campaign_name,
            project,
        }
    }

    pub fn id(&self) -> CouponId {
        self.id
    }

    pub fn campaign_name(&self) -> &str {
        &self.campaign_name
    }

    /// Project the campaign was sourced from, if any.
    pub fn project(&self) -> Option<HolderId> {
        self.project
    }

    pub fn display_name(&self) -> String {
        format!("Campaign: {}", self.campaign_name)
    }
}

/// One code in a campaign's pool.
///
/// `allocated_on` is set exactly once and never cleared; codes are never
/// handed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponCode {
    id: CouponCodeId,
    coupon_id: CouponId,
    code: String,
    allocated_on: Option<DateTime<Utc>>,
    metadata: Option<JsonValue>,
}

impl CouponCode {
    pub fn new(coupon_id: CouponId, code: impl Into<String>) -> DomainResult<Self> {
        let code = code.into();
        if code.trim().is_empty() {
            return Err(DomainError::validation("code cannot be empty"));
        }

        Ok(Self {
            id: CouponCodeId::new(),
            coupon_id,
            code,
            allocated_on: None,
            metadata: None,
        })
    }

    pub fn restore(
        id: CouponCodeId,
        coupon_id: CouponId,
        code: String,
        allocated_on: Option<DateTime<Utc>>,
        metadata: Option<JsonValue>,
    ) -> Self {
        Self {
            id,
            coupon_id,
            code,
            allocated_on,
            metadata,
        }
    }

    pub fn id(&self) -> CouponCodeId {
        self.id
    }

    pub fn coupon_id(&self) -> CouponId {
        self.coupon_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn allocated_on(&self) -> Option<DateTime<Utc>> {
        self.allocated_on
    }

    pub fn metadata(&self) -> Option<&JsonValue> {
        self.metadata.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated_on.is_some()
    }

    /// Claim the code. Fails if someone already holds it.
    pub fn allocate(&mut self, at: DateTime<Utc>, metadata: Option<JsonValue>) -> DomainResult<()> {
        if self.is_allocated() {
            return Err(DomainError::conflict(format!(
                "code '{}' is already allocated",
                self.code
            )));
        }

        self.allocated_on = Some(at);
        self.metadata = metadata;
        Ok(())
    }
}
