//! Transaction domain entity and its status state machine.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle status of a transaction.
///
/// `Pending` is the only initial state. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// Whether `self -> next` is an allowed edge of the state machine.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (TransactionStatus::Pending, TransactionStatus::Success)
                | (TransactionStatus::Pending, TransactionStatus::Failed)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown transaction status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TransactionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "SUCCESS" => Ok(TransactionStatus::Success),
            "FAILED" => Ok(TransactionStatus::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// The account initiating a transaction, as resolved by the owner directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Uuid,
    pub enabled: bool,
    pub merchant_id: Option<String>,
    pub bank_id: Option<String>,
}

impl Owner {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            enabled: true,
            merchant_id: None,
            bank_id: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_merchant(mut self, merchant_id: impl Into<String>) -> Self {
        self.merchant_id = Some(merchant_id.into());
        self
    }

    pub fn with_bank(mut self, bank_id: impl Into<String>) -> Self {
        self.bank_id = Some(bank_id.into());
        self
    }
}

/// Client-supplied part of a create request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewTransaction {
    #[serde(deserialize_with = "deserialize_amount")]
    #[schema(value_type = String, example = "49.99")]
    pub amount: BigDecimal,
    #[serde(default)]
    pub reference: Option<String>,
}

impl NewTransaction {
    pub fn new(amount: BigDecimal, reference: Option<String>) -> Self {
        Self { amount, reference }
    }
}

/// Accepts an amount as a decimal string or a JSON number.
///
/// Floats are parsed from their shortest round-trip text, so `49.99` keeps
/// scale 2 instead of picking up the binary expansion of the `f64`.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<BigDecimal, D::Error>
where
    D: Deserializer<'de>,
{
    struct AmountVisitor;

    impl<'de> de::Visitor<'de> for AmountVisitor {
        type Value = BigDecimal;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a decimal amount as a number or string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<BigDecimal, E> {
            Ok(BigDecimal::from(v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<BigDecimal, E> {
            Ok(BigDecimal::from(v))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<BigDecimal, E> {
            if !v.is_finite() {
                return Err(E::custom("amount must be finite"));
            }
            BigDecimal::from_str(&v.to_string()).map_err(E::custom)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<BigDecimal, E> {
            BigDecimal::from_str(v.trim()).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(AmountVisitor)
}

/// A monetary transaction owned by exactly one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub reference: Option<String>,
    #[schema(value_type = String, example = "49.99")]
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub merchant_id: Option<String>,
    pub bank_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the rollback for this transaction has been carried out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensated_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Builds a fresh `PENDING` transaction, copying the owner's tenant context.
    pub fn new(owner: &Owner, amount: BigDecimal, reference: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner.id,
            reference,
            amount,
            status: TransactionStatus::Pending,
            merchant_id: owner.merchant_id.clone(),
            bank_id: owner.bank_id.clone(),
            created_at: now,
            updated_at: now,
            compensated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `owner` may see this transaction under tenant scoping.
    pub fn visible_to(&self, owner: &Owner) -> bool {
        if self.owner_id != owner.id {
            return false;
        }
        if let Some(merchant_id) = &owner.merchant_id {
            return self.merchant_id.as_deref() == Some(merchant_id.as_str());
        }
        if let Some(bank_id) = &owner.bank_id {
            return self.bank_id.as_deref() == Some(bank_id.as_str());
        }
        true
    }
}
