//! Reward-tier distributions attached to pledges.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pledgebank_core::{DistributionId, DomainError, DomainResult, FundingTierId, MovementId};

use crate::holder::Holder;
use crate::movement::{CreditMovement, Metadata};

/// One reward picked inside a funding tier, with its free-form options
/// (size, colour, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardChoice {
    pub reward_id: String,
    pub options: Metadata,
}

impl RewardChoice {
    pub fn new(reward_id: impl Into<String>, options: Metadata) -> Self {
        Self {
            reward_id: reward_id.into(),
            options,
        }
    }
}

/// The funding tiers (and per-tier reward choices) a backer picked alongside a pledge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardSelection {
    tiers: BTreeMap<FundingTierId, Vec<RewardChoice>>,
}

impl RewardSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a tier with no specific reward choices.
    pub fn tier(mut self, tier: FundingTierId) -> Self {
        self.tiers.entry(tier).or_default();
        self
    }

    pub fn choice(mut self, tier: FundingTierId, choice: RewardChoice) -> Self {
        self.tiers.entry(tier).or_default().push(choice);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Build one pending distribution per selected tier.
    ///
    /// Distributions only make sense for movements paying a project; anything
    /// else is a caller bug.
    pub fn distribute(&self, movement: &CreditMovement) -> DomainResult<Vec<RewardDistribution>> {
        if self.is_empty() {
            return Ok(vec![]);
        }
        if !movement.payee().kind.is_project() {
            return Err(DomainError::invariant(
                "reward distributions require a project payee",
            ));
        }

        Ok(self
            .tiers
            .iter()
            .map(|(tier, choices)| RewardDistribution {
                id: DistributionId::new(),
                movement_id: movement.id_typed(),
                funding_tier_id: *tier,
                project: movement.payee(),
                user: movement.payer(),
                choices: choices.clone(),
                status: DistributionStatus::Pending,
                completed_at: None,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardDistribution {
    pub id: DistributionId,
    pub movement_id: MovementId,
    pub funding_tier_id: FundingTierId,
    pub project: Holder,
    pub user: Holder,
    pub choices: Vec<RewardChoice>,
    pub status: DistributionStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RewardDistribution {
    pub fn is_completed(&self) -> bool {
        self.status == DistributionStatus::Completed
    }

    /// Mark the distribution complete. Returns `false` if it already was.
    pub fn complete(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.status = DistributionStatus::Completed;
        self.completed_at = Some(at);
        true
    }
}
