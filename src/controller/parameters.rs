//! Request parameters
//!
//! Inline parameters are merged with JSON objects read from Secrets. A key
//! supplied by more than one source is a user error. The checksum covers the
//! merged values while the stored copy hides anything read from a Secret.

use aws_lc_rs::digest::{digest, SHA256};
use serde_json::Value;

use crate::crd::{Parameters, ParametersFromSource};
use crate::secrets::{read_key, SecretClient};
use crate::Error;

/// Placeholder stored in place of secret-sourced values
pub const REDACTED: &str = "<redacted>";

/// Parameters ready to send to a broker
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreparedParameters {
    /// Values sent to the broker
    pub merged: Parameters,
    /// Values safe to store in status
    pub redacted: Parameters,
    /// SHA-256 of `merged`, `None` when there are no parameters
    pub checksum: Option<String>,
}

impl PreparedParameters {
    /// Redacted parameters for a properties snapshot, `None` when empty
    pub fn stored(&self) -> Option<Parameters> {
        (!self.redacted.is_empty()).then(|| self.redacted.clone())
    }
}

/// Merge inline parameters with every `parametersFrom` source
pub async fn prepare(
    secrets: &dyn SecretClient,
    namespace: &str,
    inline: Option<&Parameters>,
    sources: &[ParametersFromSource],
) -> Result<PreparedParameters, Error> {
    let mut merged = inline.cloned().unwrap_or_default();
    let mut redacted = merged.clone();

    for source in sources {
        let secret_ref = source.secret_key_ref.as_ref().ok_or_else(|| {
            Error::validation("parametersFrom entry must set secretKeyRef")
        })?;
        let raw = read_key(secrets, namespace, &secret_ref.name, &secret_ref.key).await?;
        let value: Value = serde_json::from_slice(&raw).map_err(|e| {
            Error::validation(format!(
                "secret {}/{} key {:?} is not valid JSON: {e}",
                namespace, secret_ref.name, secret_ref.key
            ))
        })?;
        let Value::Object(object) = value else {
            return Err(Error::validation(format!(
                "secret {}/{} key {:?} must hold a JSON object",
                namespace, secret_ref.name, secret_ref.key
            )));
        };
        for (key, value) in object {
            if merged.contains_key(&key) {
                return Err(Error::parameter_conflict(format!(
                    "parameter {key:?} is set by more than one source"
                )));
            }
            redacted.insert(key.clone(), Value::String(REDACTED.to_string()));
            merged.insert(key, value);
        }
    }

    let checksum = (!merged.is_empty()).then(|| checksum(&merged)).transpose()?;
    Ok(PreparedParameters {
        merged,
        redacted,
        checksum,
    })
}

/// Hex SHA-256 of the canonical JSON encoding of `params`.
///
/// Object keys serialize in sorted order, so equal parameter sets hash equal
/// regardless of how they were written.
pub fn checksum(params: &Parameters) -> Result<String, Error> {
    let encoded = serde_json::to_vec(params)?;
    let hash = digest(&SHA256, &encoded);
    Ok(hash.as_ref().iter().map(|b| format!("{:02x}", b)).collect())
}
