//! Outbound collaborators: notification delivery and card payments.
//!
//! Both sit outside the ledger's atomic boundary. Notifications are only ever
//! invoked from deferred jobs; the payment gateway is consulted before a
//! purchased movement is allowed to complete.

use std::collections::HashSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use pledgebank_core::{DomainError, DomainResult, HolderId, MovementId};
use pledgebank_ledger::Holder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    /// To a project's leaders: someone funded the project.
    FundingSucceeded,
    /// To the backer: their pledge went through.
    FundingConfirmation,
    /// To the project side: a pledge was refunded.
    ProjectRefunded,
}

impl NotificationTemplate {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationTemplate::FundingSucceeded => "funding_succeeded",
            NotificationTemplate::FundingConfirmation => "funding_confirmation",
            NotificationTemplate::ProjectRefunded => "project_refunded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum Recipient {
    /// Everyone leading the given project.
    ProjectLeaders { project: HolderId },
    Holder { holder: Holder },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub template: NotificationTemplate,
    pub payload: JsonValue,
}

/// Delivers notifications (email or otherwise).
pub trait Notifier: Send + Sync {
    fn deliver(&self, notification: &Notification) -> DomainResult<()>;
}

/// Notifier that only writes a log record.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn deliver(&self, notification: &Notification) -> DomainResult<()> {
        info!(
            template = notification.template.as_str(),
            recipient = ?notification.recipient,
            "notification delivered"
        );
        Ok(())
    }
}

/// Notifier that keeps everything it was asked to send (tests/dev).
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_with(&self, template: NotificationTemplate) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn deliver(&self, notification: &Notification) -> DomainResult<()> {
        self.sent
            .lock()
            .map_err(|_| DomainError::collaborator("notifier lock poisoned"))?
            .push(notification.clone());
        Ok(())
    }
}

/// Card details captured for a credit purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDetails {
    pub first_name: String,
    pub last_name: String,
    pub number: String,
    pub ccv: String,
    pub expire_month: u8,
    pub expire_year: u16,
    pub country: String,
}

impl CardDetails {
    /// Number with spaces removed.
    pub fn normalized_number(&self) -> String {
        self.number.chars().filter(|c| !c.is_whitespace()).collect()
    }

    pub fn validate(&self) -> DomainResult<()> {
        for (field, value) in [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("country", &self.country),
        ] {
            if value.trim().is_empty() {
                return Err(DomainError::validation(format!("{field} cannot be empty")));
            }
        }

        let number = self.normalized_number();
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::validation("card number must be numeric"));
        }
        if self.ccv.is_empty() || !self.ccv.chars().all(|c| c.is_ascii_digit()) {
            return Err(DomainError::validation("ccv must be numeric"));
        }
        if !(1..=12).contains(&self.expire_month) {
            return Err(DomainError::validation("expire_month must be between 1 and 12"));
        }
        Ok(())
    }

    /// Card network guessed from the number prefix and length.
    pub fn card_type(&self) -> &'static str {
        let n = self.normalized_number();
        let len = n.len();
        if n.starts_with('4') && (len == 13 || len == 16) {
            "VISA"
        } else if (n.starts_with("34") || n.starts_with("37")) && len == 15 {
            "AMEX"
        } else if (n.starts_with('5') && len == 16) || (n.starts_with("36") && len == 16) {
            "MC"
        } else if (n.starts_with("6011") && len == 16) || (n.starts_with("650") && len == 16) {
            "DISC"
        } else {
            "UNKNOWN"
        }
    }
}

/// One charge attempt, tied to the movement it pays for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub movement_id: MovementId,
    pub buyer: HolderId,
    pub quantity_of_credits: i64,
    pub card: CardDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    Approved { authorization: String },
    Declined { message: String },
}

/// Authorises card charges.
///
/// `Err` means the gateway itself could not be reached; a refused card is an
/// `Ok(ChargeOutcome::Declined)`.
pub trait PaymentGateway: Send + Sync {
    fn charge(&self, request: &ChargeRequest) -> DomainResult<ChargeOutcome>;
}

/// Gateway that approves every card except the ones it was told to refuse.
#[derive(Debug, Default)]
pub struct SandboxPaymentGateway {
    declined_numbers: HashSet<String>,
}

impl SandboxPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decline(mut self, number: impl Into<String>) -> Self {
        self.declined_numbers.insert(number.into());
        self
    }
}

impl PaymentGateway for SandboxPaymentGateway {
    fn charge(&self, request: &ChargeRequest) -> DomainResult<ChargeOutcome> {
        if self.declined_numbers.contains(&request.card.normalized_number()) {
            return Ok(ChargeOutcome::Declined {
                message: "There was a problem processing your card.".to_string(),
            });
        }
        Ok(ChargeOutcome::Approved {
            authorization: format!("sandbox-{}", request.movement_id),
        })
    }
}
