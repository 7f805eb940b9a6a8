//! Secret access for parameter sources, broker credentials and binding output

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "service-catalog";

/// Raw secret contents
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Trait abstracting Secret operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Read a Secret's data, `None` when it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, Error>;

    /// Create or replace a Secret owned by `owner`.
    ///
    /// Fails if a Secret with that name exists and is controlled by another
    /// object.
    async fn put(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: OwnerReference,
    ) -> Result<(), Error>;

    /// Delete a Secret controlled by `owner_uid`, succeeding when it is
    /// already gone. A Secret controlled by another object is left alone.
    async fn delete(&self, namespace: &str, name: &str, owner_uid: &str) -> Result<(), Error>;
}

/// Read one key of a Secret, erroring when the Secret or key is missing
pub async fn read_key(
    secrets: &dyn SecretClient,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>, Error> {
    let data = secrets
        .get(namespace, name)
        .await?
        .ok_or_else(|| Error::secret(format!("secret {namespace}/{name} not found")))?;
    data.get(key)
        .cloned()
        .ok_or_else(|| Error::secret(format!("secret {namespace}/{name} has no key {key:?}")))
}

fn controller_of(secret: &Secret) -> Option<&OwnerReference> {
    secret
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Real implementation of SecretClient using the Kubernetes API
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    /// Create a new KubeSecretClient
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<SecretData>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn put(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: OwnerReference,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        if let Some(existing) = api.get_opt(name).await? {
            if let Some(controller) = controller_of(&existing) {
                if controller.uid != owner.uid {
                    return Err(Error::secret_conflict(format!(
                        "secret {namespace}/{name} is controlled by {} {}",
                        controller.kind, controller.name
                    )));
                }
            }
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&secret)).await?;
        info!(namespace, name, "credentials secret written");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, owner_uid: &str) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(existing) = api.get_opt(name).await? else {
            debug!(namespace, name, "credentials secret already gone");
            return Ok(());
        };
        if let Some(controller) = controller_of(&existing) {
            if controller.uid != owner_uid {
                debug!(namespace, name, owner = %controller.name, "secret belongs to another object, keeping it");
                return Ok(());
            }
        }
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace, name, "credentials secret deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!(namespace, name, "credentials secret already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
