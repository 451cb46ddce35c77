//! Pod listing, readiness waits and sequential pod recreation.

use super::{Cluster, PostgresRole, ROLE_LABEL};
use crate::error::ControllerError;
use crate::reconcile_helpers::poll_until;
use crate::store::Propagation;
use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info};

/// True when the pod reports the `Ready` condition.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

fn pod_role(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(ROLE_LABEL))
        .map(String::as_str)
}

/// Recreation order: replicas by name, the master last.
pub fn recreation_order(mut pods: Vec<Pod>) -> Vec<Pod> {
    pods.sort_by_key(|pod| {
        (
            pod_role(pod) == Some(PostgresRole::Master.as_str()),
            pod_name(pod),
        )
    });
    pods
}

impl Cluster {
    pub(crate) async fn list_pods(&self) -> Result<Vec<Pod>, ControllerError> {
        Ok(self
            .backends
            .kube
            .pods
            .list(&self.label_selector())
            .await?)
    }

    /// Waits until the cluster runs the declared number of pods, all ready.
    pub(crate) async fn wait_statefulset_pods_ready(&self) -> Result<(), ControllerError> {
        let pods = self.backends.kube.pods.clone();
        let selector = self.label_selector();
        let expected = usize::try_from(self.number_of_instances()).unwrap_or(0);
        let what = format!("{} pods of {}/{} are ready", expected, self.namespace, self.name);

        poll_until(
            self.config.resource_check_interval,
            self.config.resource_check_timeout,
            &what,
            || {
                let pods = pods.clone();
                let selector = selector.clone();
                async move {
                    let current = pods.list(&selector).await?;
                    Ok::<bool, ControllerError>(
                        current.len() == expected && current.iter().all(is_pod_ready),
                    )
                }
            },
        )
        .await
    }

    /// Recreates every pod of the cluster, one at a time.
    pub(crate) async fn recreate_pods(&self) -> Result<(), ControllerError> {
        let pods = recreation_order(self.list_pods().await?);
        info!(
            "cluster {}/{}: recreating {} pods",
            self.namespace,
            self.name,
            pods.len()
        );
        for pod in &pods {
            self.recreate_pod(pod).await?;
        }
        Ok(())
    }

    /// Deletes the pod and waits for its replacement (a new uid) to become
    /// ready.
    async fn recreate_pod(&self, pod: &Pod) -> Result<(), ControllerError> {
        let store = self.backends.kube.pods.clone();
        let name = pod_name(pod);
        let old_uid = pod.metadata.uid.clone();

        debug!("deleting pod {}/{}", self.namespace, name);
        match store.delete(&name, Propagation::Background).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("pod {}/{} is already gone", self.namespace, name);
            }
            Err(e) => return Err(e.into()),
        }

        let what = format!("pod {}/{} is recreated and ready", self.namespace, name);
        poll_until(
            self.config.resource_check_interval,
            self.config.pod_label_wait_timeout,
            &what,
            || {
                let store = store.clone();
                let name = name.clone();
                let old_uid = old_uid.clone();
                async move {
                    match store.get(&name).await {
                        Ok(current) => Ok::<bool, ControllerError>(
                            current.metadata.uid != old_uid && is_pod_ready(&current),
                        ),
                        Err(e) if e.is_not_found() => Ok(false),
                        Err(e) => Err(e.into()),
                    }
                }
            },
        )
        .await?;
        info!("pod {}/{} has been recreated", self.namespace, name);
        Ok(())
    }
}
