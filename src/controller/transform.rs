//! Credential shaping before credentials are written to a Secret

use serde_json::Value;

use crate::broker::Credentials;
use crate::crd::SecretTransform;
use crate::secrets::SecretData;
use crate::Error;

/// Apply `transforms` in order. Renaming onto an existing key replaces it.
pub fn apply(credentials: &mut Credentials, transforms: &[SecretTransform]) {
    for transform in transforms {
        if let Some(rename) = &transform.rename_key {
            if let Some(value) = credentials.remove(&rename.from) {
                credentials.insert(rename.to.clone(), value);
            }
        }
    }
}

/// Secret payload for `credentials`.
///
/// Strings are stored as their raw bytes, everything else as JSON text.
pub fn secret_data(credentials: &Credentials) -> Result<SecretData, Error> {
    credentials
        .iter()
        .map(|(key, value)| -> Result<(String, Vec<u8>), Error> {
            let bytes = match value {
                Value::String(s) => s.as_bytes().to_vec(),
                other => serde_json::to_vec(other)?,
            };
            Ok((key.clone(), bytes))
        })
        .collect()
}
