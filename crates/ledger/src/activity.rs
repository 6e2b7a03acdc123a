//! Activity-feed entries produced by completed pledges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use pledgebank_core::{ActivityId, HolderId};

use crate::holder::Holder;

/// The person (or system account) on whose behalf something happened.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: HolderId,
    pub name: String,
}

impl Actor {
    pub fn new(id: HolderId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Funded,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Funded => "funded",
        }
    }
}

/// One line in the activity feed.
///
/// Keyed by `(actor, target)`: a refund removes every `Funded` entry recorded
/// for the pair, not only the one matching the refunded movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub actor: HolderId,
    pub target: Holder,
    pub action: ActivityAction,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn funded(actor: HolderId, target: Holder, payload: JsonValue, at: DateTime<Utc>) -> Self {
        Self {
            id: ActivityId::new(),
            actor,
            target,
            action: ActivityAction::Funded,
            payload,
            created_at: at,
        }
    }

    pub fn is_funding_of(&self, actor: HolderId, target: &Holder) -> bool {
        self.action == ActivityAction::Funded && self.actor == actor && self.target == *target
    }
}
