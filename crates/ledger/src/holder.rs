//! Polymorphic payer/payee references.

use serde::{Deserialize, Serialize};

use pledgebank_core::HolderId;

/// What kind of entity sits behind a [`Holder`].
///
/// Capabilities are answered here rather than by inspecting concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolderKind {
    User,
    Project,
    /// Origin of credits bought through the payment gateway.
    Transaction,
    /// Manual/system correction.
    Adjustment,
}

impl HolderKind {
    /// Holders with a derived balance of their own.
    pub fn is_balance_bearing(self) -> bool {
        matches!(self, HolderKind::User | HolderKind::Project)
    }

    /// Holders whose outgoing movements to a project are pledges.
    pub fn can_pledge(self) -> bool {
        matches!(self, HolderKind::User)
    }

    pub fn is_project(self) -> bool {
        matches!(self, HolderKind::Project)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HolderKind::User => "user",
            HolderKind::Project => "project",
            HolderKind::Transaction => "transaction",
            HolderKind::Adjustment => "adjustment",
        }
    }
}

impl core::fmt::Display for HolderKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can send or receive credits, identified by `(kind, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Holder {
    pub kind: HolderKind,
    pub id: HolderId,
}

impl Holder {
    pub fn new(kind: HolderKind, id: HolderId) -> Self {
        Self { kind, id }
    }

    pub fn user(id: HolderId) -> Self {
        Self::new(HolderKind::User, id)
    }

    pub fn project(id: HolderId) -> Self {
        Self::new(HolderKind::Project, id)
    }

    pub fn transaction(id: HolderId) -> Self {
        Self::new(HolderKind::Transaction, id)
    }

    pub fn adjustment(id: HolderId) -> Self {
        Self::new(HolderKind::Adjustment, id)
    }

    pub fn is_balance_bearing(&self) -> bool {
        self.kind.is_balance_bearing()
    }
}

impl core::fmt::Display for Holder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_users_and_projects_bear_balances() {
        assert!(HolderKind::User.is_balance_bearing());
        assert!(HolderKind::Project.is_balance_bearing());
        assert!(!HolderKind::Transaction.is_balance_bearing());
        assert!(!HolderKind::Adjustment.is_balance_bearing());
    }

    #[test]
    fn display_is_kind_prefixed() {
        let id = HolderId::new();
        assert_eq!(Holder::project(id).to_string(), format!("project:{id}"));
    }

    #[test]
    fn serializes_kind_in_snake_case() {
        let holder = Holder::adjustment(HolderId::new());
        let json = serde_json::to_value(holder).unwrap();
        assert_eq!(json["kind"], "adjustment");
    }
}
