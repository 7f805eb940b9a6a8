//! Shared setup for cluster-backed tests

use std::future::Future;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

use service_catalog::crd::all_crds;

/// Namespace used for namespaced test objects
pub const TEST_NAMESPACE: &str = "default";

/// Connect to the current kube context and make sure the CRDs are served
pub async fn ensure_test_cluster() -> Client {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client = Client::try_default()
        .await
        .expect("a reachable cluster in the current kube context");

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("service-catalog-tests").force();
    for crd in all_crds() {
        let name = crd.metadata.name.clone().expect("CRD name");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .expect("CRD applies");
        wait_for("CRD established", Duration::from_secs(30), || {
            let crds = crds.clone();
            let name = name.clone();
            async move {
                crds.get(&name)
                    .await
                    .ok()
                    .and_then(|crd| crd.status)
                    .and_then(|status| status.conditions)
                    .is_some_and(|conds| {
                        conds
                            .iter()
                            .any(|c| c.type_ == "Established" && c.status == "True")
                    })
            }
        })
        .await;
    }

    client
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Unique object name so reruns don't collide with leftovers
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
