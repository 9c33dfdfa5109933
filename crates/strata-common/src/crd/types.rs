//! Shared status types: conditions and bounded condition history

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::reason::Reason;

/// Condition type written by every Strata controller
pub const CONDITION_TYPE_AVAILABLE: &str = "Available";

/// Maximum number of conditions kept in a resource's history
pub const CONDITION_HISTORY_CAP: usize = 10;

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (always "Available" for Strata resources)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::at(type_, status, reason, message, Utc::now())
    }

    /// Create a condition with an explicit transition time
    pub fn at(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: at,
        }
    }

    /// Availability condition for a typed reason, readiness derived from its class
    pub fn for_reason<R: Reason>(reason: R, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::at(
            CONDITION_TYPE_AVAILABLE,
            reason.readiness(),
            reason.to_string(),
            message,
            at,
        )
    }
}

/// Append a condition, dropping the oldest entries beyond the history cap
pub fn push_condition(history: &mut Vec<Condition>, condition: Condition) {
    history.push(condition);
    if history.len() > CONDITION_HISTORY_CAP {
        let excess = history.len() - CONDITION_HISTORY_CAP;
        history.drain(..excess);
    }
}

/// Newest condition in a history
pub fn latest(history: &[Condition]) -> Option<&Condition> {
    history.last()
}

/// Parse the newest condition's reason as a typed reason.
///
/// A reason string the kind doesn't recognise yields `None`.
pub fn current_reason<R: Reason>(history: &[Condition]) -> Option<R> {
    latest(history).and_then(|c| c.reason.parse().ok())
}

/// Whether the newest condition reports the resource as ready
pub fn is_ready(history: &[Condition]) -> bool {
    latest(history).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Reference to a key inside a Secret in the resource's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the Secret's data
    pub key: String,
}
