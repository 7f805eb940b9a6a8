//! Supporting types shared by the service catalog CRDs
//!
//! Everything in this module is part of the persisted status contract read by
//! other tooling, so JSON field names and enum string values must stay stable.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reporting whether a resource is usable
pub const CONDITION_READY: &str = "Ready";

/// Condition type reporting a terminal failure that will not be retried
pub const CONDITION_FAILED: &str = "Failed";

/// Condition type reporting that orphan mitigation is running (instances only)
pub const CONDITION_ORPHAN_MITIGATION: &str = "OrphanMitigation";

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
    /// Type of condition (Ready, Failed, OrphanMitigation)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the condition's status changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Set a condition on an ordered condition list.
///
/// Conditions are replaced by type and never reordered. The transition time
/// only moves when the status changes; a reason/message change alone keeps
/// the previous timestamp. Returns true when the list was modified.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                *existing = condition;
                return true;
            }
            if existing.reason == condition.reason && existing.message == condition.message {
                return false;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when a condition of the given type exists with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Identity of the user that last changed a resource's spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// User name
    pub username: String,
    /// User UID
    pub uid: String,
    /// Groups the user belongs to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Additional authenticator-provided information
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Reference to a cluster-scoped object by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ClusterObjectReference {
    /// Name of the referent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl ClusterObjectReference {
    /// Create a reference to the named object
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct LocalObjectReference {
    /// Name of the referent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Reference to an object in an explicit namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectReference {
    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Name of the referent
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Reference to a single key of a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct SecretKeyReference {
    /// Name of the Secret
    pub name: String,
    /// Key within the Secret whose value is a JSON object of parameters
    pub key: String,
}

/// A source of request parameters other than the inline `parameters` field
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Secret key holding a JSON object of parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Inline request parameters (a JSON object)
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// A transformation applied to binding credentials before they land in a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretTransform {
    /// Rename a credential key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_key: Option<RenameKeyTransform>,
}

/// Rename a key in the credential map
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RenameKeyTransform {
    /// Original key name
    pub from: String,
    /// New key name
    pub to: String,
}

/// Operation the controller is performing against the broker for an instance
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum InstanceOperation {
    /// Instance is being provisioned
    Provision,
    /// Instance plan or parameters are being updated
    Update,
    /// Instance is being deprovisioned
    Deprovision,
}

impl std::fmt::Display for InstanceOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provision => write!(f, "Provision"),
            Self::Update => write!(f, "Update"),
            Self::Deprovision => write!(f, "Deprovision"),
        }
    }
}

/// Operation the controller is performing against the broker for a binding
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BindingOperation {
    /// Binding is being created
    Bind,
    /// Binding is being removed
    Unbind,
}

impl std::fmt::Display for BindingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind => write!(f, "Bind"),
            Self::Unbind => write!(f, "Unbind"),
        }
    }
}

/// Whether the broker holds a provisioned instance
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisionStatus {
    /// The broker confirmed the instance exists
    Provisioned,
    /// Never provisioned, or deprovisioned
    #[default]
    #[serde(alias = "")]
    NotProvisioned,
}

/// Cleanup obligation toward the broker.
///
/// Used for both instance deprovisioning and binding unbinding. Transitions
/// only move forward: `NotRequired → Required → {Succeeded | Failed}`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Nothing was ever sent to the broker
    #[default]
    #[serde(alias = "")]
    NotRequired,
    /// A request reached the broker; cleanup must happen before deletion
    Required,
    /// Cleanup succeeded
    Succeeded,
    /// Cleanup was abandoned after the retry budget ran out
    Failed,
}

impl CleanupStatus {
    fn rank(self) -> u8 {
        match self {
            Self::NotRequired => 0,
            Self::Required => 1,
            Self::Succeeded | Self::Failed => 2,
        }
    }

    /// Move forward to `next`, ignoring backward or sideways moves.
    ///
    /// Terminal values are final. Returns true if the value changed.
    pub fn advance(&mut self, next: CleanupStatus) -> bool {
        if next.rank() > self.rank() {
            *self = next;
            true
        } else {
            false
        }
    }

    /// True for `Succeeded` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRequired => write!(f, "NotRequired"),
            Self::Required => write!(f, "Required"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Instance deprovision status
pub type DeprovisionStatus = CleanupStatus;

/// Binding unbind status
pub type UnbindStatus = CleanupStatus;

/// Serde adapter for Kubernetes `metav1.Duration` strings ("15m0s", "1h", "250ms")
pub mod go_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse a Go-style duration string
    pub fn parse(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        if s == "0" {
            return Ok(Duration::ZERO);
        }

        let mut total = 0f64;
        let mut rest = s;
        while !rest.is_empty() {
            let num_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
            if num_end == 0 {
                return Err(format!("invalid duration {input:?}"));
            }
            let value: f64 = rest[..num_end]
                .parse()
                .map_err(|_| format!("invalid number in duration {input:?}"))?;
            rest = &rest[num_end..];

            let unit_end = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let scale = match &rest[..unit_end] {
                "h" => 3600.0,
                "m" => 60.0,
                "s" => 1.0,
                "ms" => 1e-3,
                "us" | "µs" => 1e-6,
                "ns" => 1e-9,
                other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
            };
            total += value * scale;
            rest = &rest[unit_end..];
        }

        Ok(Duration::from_secs_f64(total))
    }

    /// Format a duration the way Go's `time.Duration.String` does for
    /// second-or-larger values ("1h0m0s", "15m0s", "30s")
    pub fn format(d: Duration) -> String {
        if d < Duration::from_secs(1) {
            return format!("{}ms", d.as_millis());
        }
        let total = d.as_secs();
        let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
        let frac = d.subsec_millis();
        let secs = if frac == 0 {
            format!("{s}s")
        } else {
            let f = format!("{:03}", frac);
            format!("{s}.{}s", f.trim_end_matches('0'))
        };
        if h > 0 {
            format!("{h}h{m}m{secs}")
        } else if m > 0 {
            format!("{m}m{secs}")
        } else {
            secs
        }
    }

    /// Serialize an optional duration
    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_str(&format(*d)),
            None => ser.serialize_none(),
        }
    }

    /// Deserialize an optional duration
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        raw.map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Default relist interval for `Duration` brokers
pub const DEFAULT_RELIST_DURATION: Duration = Duration::from_secs(15 * 60);
