//! StatefulSet convergence and the rolling-update marker.
//!
//! The marker lives in the `ROLLING_UPDATE_ANNOTATION` annotation of the
//! StatefulSet. Its effective value is the live annotation OR the annotation
//! of the object this cluster last wrote, so a pending rolling update
//! survives both operator restarts and objects rewritten behind our back.
//! It is cleared only after every pod has been recreated.

use super::compare::compare_statefulset;
use super::{name_from_meta, Cluster, ROLLING_UPDATE_ANNOTATION};
use crate::error::ControllerError;
use crate::reconcile_helpers::poll_until;
use crate::store::Propagation;
use k8s_openapi::api::apps::v1::StatefulSet;
use tracing::{debug, info, warn};

/// Marker value persisted on a StatefulSet; absent or unparsable is `false`.
pub fn rolling_update_marker(statefulset: &StatefulSet) -> bool {
    statefulset
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ROLLING_UPDATE_ANNOTATION))
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

pub fn set_rolling_update_marker(statefulset: &mut StatefulSet, required: bool) {
    statefulset
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ROLLING_UPDATE_ANNOTATION.to_string(), required.to_string());
}

impl Cluster {
    /// Effective marker: persisted value merged with the cached object.
    fn merge_rolling_update_marker(&self, live: &StatefulSet) -> bool {
        let persisted = rolling_update_marker(live);
        let cached = self
            .observed
            .statefulset
            .as_ref()
            .is_some_and(rolling_update_marker);
        if cached && !persisted {
            info!(
                "statefulset {} lost its rolling update flag, restoring it from the cache",
                name_from_meta(&live.metadata)
            );
        }
        persisted || cached
    }

    pub(crate) async fn sync_statefulset(&mut self) -> Result<(), ControllerError> {
        let store = self.backends.kube.statefulsets.clone();
        let name = self.statefulset_name();

        let (rolling_update_required, written) = match store.get(&name).await {
            Err(e) if e.is_not_found() => {
                self.observed.statefulset = None;
                info!("could not find the statefulset of cluster {}/{}", self.namespace, self.name);

                // Pods left behind by a deleted StatefulSet carry the old
                // definition and have to be recreated.
                let orphans = self.list_pods().await?;
                let required = !orphans.is_empty();
                if required {
                    warn!(
                        "found {} pods from the previous statefulset: trigger rolling update",
                        orphans.len()
                    );
                }

                let created = self.create_statefulset(required).await?;
                self.wait_statefulset_pods_ready().await?;
                info!("created missing statefulset {}", name_from_meta(&created.metadata));
                (required, true)
            }
            Err(e) => return Err(e.into()),
            Ok(current) => {
                let mut required = self.merge_rolling_update_marker(&current);
                self.observed.statefulset = Some(current.clone());

                let mut desired = self.generate_statefulset()?;
                set_rolling_update_marker(&mut desired, required);

                let comparison = compare_statefulset(&current, &desired);
                if comparison.matches() {
                    debug!("statefulset {} is in sync", name_from_meta(&current.metadata));
                    (required, false)
                } else {
                    if comparison.rolling_update && !required {
                        required = true;
                        set_rolling_update_marker(&mut desired, true);
                    }
                    for reason in &comparison.reasons {
                        info!(
                            "statefulset {} is not in the desired state: {}",
                            name_from_meta(&current.metadata),
                            reason
                        );
                    }
                    if comparison.replace {
                        self.replace_statefulset(desired).await?;
                    } else {
                        self.update_statefulset(&current, desired).await?;
                    }
                    (required, true)
                }
            }
        };

        // Bootstrap-only parameters need a restart to apply, so they go out
        // before any pod is recreated.
        self.check_and_set_global_postgresql_configuration(written).await?;

        if rolling_update_required {
            debug!("performing rolling update of cluster {}/{}", self.namespace, self.name);
            self.recreate_pods().await?;
            info!("pods of cluster {}/{} have been recreated", self.namespace, self.name);
            if let Err(e) = self.persist_rolling_update_marker(false).await {
                warn!(
                    "could not clear the rolling update flag of statefulset {}/{}: {}",
                    self.namespace, name, e
                );
            }
        }
        Ok(())
    }

    async fn create_statefulset(
        &mut self,
        rolling_update_required: bool,
    ) -> Result<StatefulSet, ControllerError> {
        let mut desired = self.generate_statefulset()?;
        set_rolling_update_marker(&mut desired, rolling_update_required);
        let created = self.backends.kube.statefulsets.create(&desired).await?;
        self.observed.statefulset = Some(created.clone());
        Ok(created)
    }

    async fn update_statefulset(
        &mut self,
        current: &StatefulSet,
        mut desired: StatefulSet,
    ) -> Result<(), ControllerError> {
        desired.metadata.resource_version = current.metadata.resource_version.clone();
        let updated = self.backends.kube.statefulsets.update(&desired).await?;
        info!("updated statefulset {}", name_from_meta(&updated.metadata));
        self.observed.statefulset = Some(updated);
        Ok(())
    }

    /// Deletes the StatefulSet leaving its pods running, waits until it is
    /// gone and creates the desired one.
    async fn replace_statefulset(&mut self, desired: StatefulSet) -> Result<(), ControllerError> {
        let store = self.backends.kube.statefulsets.clone();
        let name = self.statefulset_name();
        info!("replacing statefulset {}/{}", self.namespace, name);

        match store.delete(&name, Propagation::Orphan).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let what = format!("statefulset {}/{} is deleted", self.namespace, name);
        poll_until(
            self.config.resource_check_interval,
            self.config.resource_check_timeout,
            &what,
            || {
                let store = store.clone();
                let name = name.clone();
                async move {
                    match store.get(&name).await {
                        Ok(_) => Ok::<bool, ControllerError>(false),
                        Err(e) if e.is_not_found() => Ok(true),
                        Err(e) => Err(e.into()),
                    }
                }
            },
        )
        .await?;

        let created = store.create(&desired).await?;
        info!("replaced statefulset {}", name_from_meta(&created.metadata));
        self.observed.statefulset = Some(created);
        Ok(())
    }

    /// Writes the marker onto the live StatefulSet.
    async fn persist_rolling_update_marker(&mut self, required: bool) -> Result<(), ControllerError> {
        let store = self.backends.kube.statefulsets.clone();
        let mut current = store.get(&self.statefulset_name()).await?;
        if rolling_update_marker(&current) == required
            && current
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(ROLLING_UPDATE_ANNOTATION))
        {
            self.observed.statefulset = Some(current);
            return Ok(());
        }
        set_rolling_update_marker(&mut current, required);
        let updated = store.update(&current).await?;
        debug!(
            "set rolling update flag of statefulset {} to {}",
            name_from_meta(&updated.metadata),
            required
        );
        self.observed.statefulset = Some(updated);
        Ok(())
    }
}
