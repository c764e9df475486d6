use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type BargainId = i64;

/// A stored or transmitted name that matches no known variant.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown {kind} {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// A record that breaks one of the bargain invariants.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("bargain {id}: {reason}")]
pub struct InvariantViolation {
    pub id: BargainId,
    pub reason: String,
}

/// One side of a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Vendor,
    Supplier,
}

impl Party {
    pub fn counterparty(self) -> Party {
        match self {
            Party::Vendor => Party::Supplier,
            Party::Supplier => Party::Vendor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Party::Vendor => "vendor",
            Party::Supplier => "supplier",
        }
    }

}

impl FromStr for Party {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vendor" => Ok(Party::Vendor),
            "supplier" => Ok(Party::Supplier),
            _ => Err(UnknownVariant {
                kind: "party",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authenticated caller: which user, acting as which side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub user_id: i64,
    pub party: Party,
}

impl Actor {
    pub const fn vendor(user_id: i64) -> Self {
        Self { user_id, party: Party::Vendor }
    }

    pub const fn supplier(user_id: i64) -> Self {
        Self { user_id, party: Party::Supplier }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BargainStatus {
    Pending,
    Accepted,
    Rejected,
    Agreed,
    Completed,
}

impl BargainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BargainStatus::Pending => "pending",
            BargainStatus::Accepted => "accepted",
            BargainStatus::Rejected => "rejected",
            BargainStatus::Agreed => "agreed",
            BargainStatus::Completed => "completed",
        }
    }

    pub const ALL: [BargainStatus; 5] = [
        BargainStatus::Pending,
        BargainStatus::Accepted,
        BargainStatus::Rejected,
        BargainStatus::Agreed,
        BargainStatus::Completed,
    ];

    /// `rejected` and `completed` end the negotiation for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, BargainStatus::Rejected | BargainStatus::Completed)
    }

    /// Statuses that occupy the `(product, vendor, supplier)` slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            BargainStatus::Pending | BargainStatus::Accepted | BargainStatus::Agreed
        )
    }

    /// Statuses in which a final price must be present.
    pub fn carries_price(self) -> bool {
        matches!(
            self,
            BargainStatus::Accepted | BargainStatus::Agreed | BargainStatus::Completed
        )
    }
}

impl FromStr for BargainStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BargainStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for BargainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BargainMessage {
    pub sender: Party,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Context supplied by the cart when a vendor opens a negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBargain {
    pub product_id: i64,
    pub product_name: String,
    pub supplier_id: i64,
    pub supplier_name: String,
    pub vendor_id: i64,
    pub vendor_name: String,
    pub original_price: f64,
    pub quantity: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
}

fn default_unit() -> String {
    "kg".to_string()
}

impl NewBargain {
    pub fn key(&self) -> BargainKey {
        BargainKey {
            product_id: self.product_id,
            vendor_id: self.vendor_id,
            supplier_id: self.supplier_id,
        }
    }
}

/// At most one active bargain exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BargainKey {
    pub product_id: i64,
    pub vendor_id: i64,
    pub supplier_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bargain {
    pub id: BargainId,
    pub product_id: i64,
    pub product_name: String,
    pub supplier_id: i64,
    pub supplier_name: String,
    pub vendor_id: i64,
    pub vendor_name: String,
    pub original_price: f64,
    pub quantity: f64,
    pub unit: String,
    pub messages: Vec<BargainMessage>,
    pub status: BargainStatus,
    pub vendor_accepted: bool,
    pub supplier_accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<Party>,
    pub vendor_deal_done: bool,
    pub supplier_deal_done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<i64>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Bargain {
    pub fn open(id: BargainId, ctx: NewBargain, now: DateTime<Utc>) -> Self {
        Self {
            id,
            product_id: ctx.product_id,
            product_name: ctx.product_name,
            supplier_id: ctx.supplier_id,
            supplier_name: ctx.supplier_name,
            vendor_id: ctx.vendor_id,
            vendor_name: ctx.vendor_name,
            original_price: ctx.original_price,
            quantity: ctx.quantity,
            unit: ctx.unit,
            messages: Vec::new(),
            status: BargainStatus::Pending,
            vendor_accepted: false,
            supplier_accepted: false,
            accepted_by: None,
            vendor_deal_done: false,
            supplier_deal_done: false,
            final_price: None,
            revision: 0,
            created_at: now,
        }
    }

    pub fn key(&self) -> BargainKey {
        BargainKey {
            product_id: self.product_id,
            vendor_id: self.vendor_id,
            supplier_id: self.supplier_id,
        }
    }

    /// User id occupying the given side of this bargain.
    pub fn participant(&self, party: Party) -> i64 {
        match party {
            Party::Vendor => self.vendor_id,
            Party::Supplier => self.supplier_id,
        }
    }

    pub fn involves(&self, actor: &Actor) -> bool {
        self.participant(actor.party) == actor.user_id
    }

    /// Most recent message carrying a numeric offer.
    pub fn last_offer(&self) -> Option<&BargainMessage> {
        self.messages.iter().rev().find(|m| m.offer.is_some())
    }

    pub fn accepted_flag(&self, party: Party) -> bool {
        match party {
            Party::Vendor => self.vendor_accepted,
            Party::Supplier => self.supplier_accepted,
        }
    }

    pub fn deal_done_flag(&self, party: Party) -> bool {
        match party {
            Party::Vendor => self.vendor_deal_done,
            Party::Supplier => self.supplier_deal_done,
        }
    }

    /// Whether `party` has something to act on in this bargain.
    pub fn needs_attention(&self, party: Party) -> bool {
        match self.status {
            BargainStatus::Pending => self
                .messages
                .last()
                .map_or(false, |m| m.sender == party.counterparty()),
            BargainStatus::Accepted => {
                self.accepted_by == Some(party.counterparty()) && !self.deal_done_flag(party)
            }
            _ => false,
        }
    }

    /// Checks the record-level invariants; used by tests and store debug assertions.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let violation = |reason: String| InvariantViolation { id: self.id, reason };
        if self.final_price.is_some() != self.status.carries_price() {
            return Err(violation(format!(
                "final price {:?} inconsistent with status {}",
                self.final_price, self.status
            )));
        }
        if (self.vendor_deal_done || self.supplier_deal_done)
            && !matches!(
                self.status,
                BargainStatus::Accepted | BargainStatus::Agreed | BargainStatus::Completed
            )
        {
            return Err(violation(format!("deal-done flag set while {}", self.status)));
        }
        if matches!(self.status, BargainStatus::Agreed | BargainStatus::Completed)
            && !(self.vendor_deal_done && self.supplier_deal_done)
        {
            return Err(violation(format!("{} without both confirmations", self.status)));
        }
        if self.status == BargainStatus::Rejected && (self.vendor_accepted || self.supplier_accepted)
        {
            return Err(violation("rejected bargain still carries an acceptance".to_string()));
        }
        Ok(())
    }
}

/// Negotiated price handed to the cart once a bargain is agreed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BargainedPrice {
    pub bargain_id: BargainId,
    pub product_id: i64,
    pub vendor_id: i64,
    pub supplier_id: i64,
    pub supplier_name: String,
    pub bargained_price_per_unit: i64,
    pub original_price_per_unit: f64,
    pub quantity: f64,
    pub unit: String,
}

impl BargainedPrice {
    pub fn from_agreed(bargain: &Bargain) -> Option<Self> {
        let price = bargain.final_price?;
        Some(Self {
            bargain_id: bargain.id,
            product_id: bargain.product_id,
            vendor_id: bargain.vendor_id,
            supplier_id: bargain.supplier_id,
            supplier_name: bargain.supplier_name.clone(),
            bargained_price_per_unit: price,
            original_price_per_unit: bargain.original_price,
            quantity: bargain.quantity,
            unit: bargain.unit.clone(),
        })
    }

    /// Amount saved over the whole quantity compared to the list price.
    pub fn savings(&self) -> f64 {
        (self.original_price_per_unit - self.bargained_price_per_unit as f64) * self.quantity
    }
}

// Request bodies

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenBargainRequest {
    pub product_id: i64,
    pub product_name: String,
    pub supplier_id: i64,
    pub supplier_name: String,
    pub vendor_name: String,
    pub original_price: f64,
    pub quantity: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionQuery {
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub product_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_id: i64,
    pub role: Party,
}
