use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::graph::types::Header;

/// The closed classification taxonomy. Order matters: folders are
/// reconciled in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    NoReplyNoInfo,
    NoReplyWithInfo,
    AutoReplyNoInfo,
    AutoReplyWithInfo,
    InvoiceRequestNoInfo,
    ClaimsPaidNoProof,
    ClaimsPaidWithProof,
    ManualReview,
    Uncategorised,
}

impl Label {
    pub const ALL: [Label; 9] = [
        Label::NoReplyNoInfo,
        Label::NoReplyWithInfo,
        Label::AutoReplyNoInfo,
        Label::AutoReplyWithInfo,
        Label::InvoiceRequestNoInfo,
        Label::ClaimsPaidNoProof,
        Label::ClaimsPaidWithProof,
        Label::ManualReview,
        Label::Uncategorised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::NoReplyNoInfo => "no_reply_no_info",
            Label::NoReplyWithInfo => "no_reply_with_info",
            Label::AutoReplyNoInfo => "auto_reply_no_info",
            Label::AutoReplyWithInfo => "auto_reply_with_info",
            Label::InvoiceRequestNoInfo => "invoice_request_no_info",
            Label::ClaimsPaidNoProof => "claims_paid_no_proof",
            Label::ClaimsPaidWithProof => "claims_paid_with_proof",
            Label::ManualReview => "manual_review",
            Label::Uncategorised => "uncategorised",
        }
    }

    /// Unknown labels become `Uncategorised`.
    pub fn coerce(raw: &str) -> Label {
        raw.parse().unwrap_or(Label::Uncategorised)
    }

    /// Folder display name, e.g. "Invoice Request No Info".
    pub fn display_name(&self) -> String {
        self.as_str()
            .split('_')
            .filter(|word| !word.is_empty())
            .map(title_case)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_response_eligible(&self) -> bool {
        matches!(self, Label::InvoiceRequestNoInfo | Label::ClaimsPaidNoProof)
    }

    /// Left unread for a human to pick up.
    pub fn needs_manual_review(&self) -> bool {
        matches!(self, Label::ManualReview | Label::Uncategorised)
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel(pub String);

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown label: {}", self.0)
    }
}

impl std::error::Error for UnknownLabel {}

impl FromStr for Label {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One classification as returned by the model API. The label is kept as
/// the raw string; use [`Classification::label`] for the coerced value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub method: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entities: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub matching_patterns: Vec<Value>,
}

impl Classification {
    pub fn fallback(method: &str) -> Self {
        Self {
            label: Label::Uncategorised.as_str().to_string(),
            confidence: 0.0,
            method: method.to_string(),
            entities: Map::new(),
            matching_patterns: Vec::new(),
        }
    }

    pub fn label(&self) -> Label {
        Label::coerce(&self.label)
    }

    /// Confidence limited to [0, 1]; NaN reads as 0.
    pub fn clamped_confidence(&self) -> f64 {
        if self.confidence.is_nan() {
            0.0
        } else {
            self.confidence.clamp(0.0, 1.0)
        }
    }
}

/// Recognised entity shapes extracted by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    OutOfOffice {
        person: Value,
        contact_person: Value,
        dates: Value,
    },
    LeftCompany {
        person: Value,
        replacement: Value,
    },
    None,
}

/// Typed view over the classifier's entity map. Keys outside the recognised
/// kind stay in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entities {
    pub kind: EntityKind,
    pub extra: Map<String, Value>,
}

const OOO_KEYS: [&str; 3] = ["ooo_person", "ooo_contact_person", "ooo_dates"];
const LEFT_KEYS: [&str; 2] = ["left_person", "replacement_contact"];

impl Entities {
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut extra = map.clone();
        let mut take = |key: &str| extra.remove(key).unwrap_or_else(empty_object);

        let kind = if map.contains_key("ooo_person") {
            EntityKind::OutOfOffice {
                person: take(OOO_KEYS[0]),
                contact_person: take(OOO_KEYS[1]),
                dates: take(OOO_KEYS[2]),
            }
        } else if map.contains_key("left_person") {
            EntityKind::LeftCompany {
                person: take(LEFT_KEYS[0]),
                replacement: take(LEFT_KEYS[1]),
            }
        } else {
            EntityKind::None
        };

        Self { kind, extra }
    }

    /// Flat map in the classifier's own key layout.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        match &self.kind {
            EntityKind::OutOfOffice {
                person,
                contact_person,
                dates,
            } => {
                map.insert(OOO_KEYS[0].into(), person.clone());
                map.insert(OOO_KEYS[1].into(), contact_person.clone());
                map.insert(OOO_KEYS[2].into(), dates.clone());
            }
            EntityKind::LeftCompany {
                person,
                replacement,
            } => {
                map.insert(LEFT_KEYS[0].into(), person.clone());
                map.insert(LEFT_KEYS[1].into(), replacement.clone());
            }
            EntityKind::None => {}
        }
        map
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, EntityKind::None) && self.extra.is_empty()
    }
}

impl Default for Entities {
    fn default() -> Self {
        Self {
            kind: EntityKind::None,
            extra: Map::new(),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Result of a collaborator call that must never block the pipeline.
/// `Degraded` carries the safe default to continue with.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutcome<T> {
    Ok(T),
    Degraded { fallback: T, reason: String },
}

impl<T> ModelOutcome<T> {
    pub fn degraded(fallback: T, reason: impl Into<String>) -> Self {
        ModelOutcome::Degraded {
            fallback,
            reason: reason.into(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ModelOutcome::Degraded { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            ModelOutcome::Ok(value) => value,
            ModelOutcome::Degraded { fallback, .. } => fallback,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            ModelOutcome::Ok(value) => value,
            ModelOutcome::Degraded { fallback, .. } => fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyRequest {
    pub subject: String,
    pub body: String,
    pub headers: Vec<Header>,
    pub sender_email: String,
    pub recipient_emails: Vec<String>,
    pub has_attachments: bool,
    pub had_threads: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    pub subject: String,
    pub body: String,
    pub label: Label,
    pub entities: Map<String, Value>,
}
