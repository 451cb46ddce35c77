//! Desired objects generated from the cluster spec.
//!
//! Pure functions of the current spec and operator config; the results are
//! only ever compared against or written over observed objects, never
//! mutated in place by the convergence code.

use super::database::POSTGRES_PORT;
use super::users::SystemUser;
use super::{Cluster, PostgresRole, ROLE_LABEL};
use crate::error::ControllerError;
use crds::parse_quantity_bytes;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Endpoints, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, Secret, SecretKeySelector, Service, ServicePort,
    ServiceSpec, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

pub const DATA_VOLUME_NAME: &str = "pgdata";
const DATA_VOLUME_PATH: &str = "/home/postgres/pgdata";
const PATRONI_PORT_NAME: &str = "patroni";

impl Cluster {
    fn object_meta(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    fn service_labels(&self, role: PostgresRole) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());
        labels
    }

    fn load_balancer_enabled(&self, role: PostgresRole) -> bool {
        match role {
            PostgresRole::Master => self.spec.enable_master_load_balancer,
            PostgresRole::Replica => self.spec.enable_replica_load_balancer,
        }
        .unwrap_or(false)
    }

    /// Service for one role. The master service has no selector: Patroni
    /// maintains its endpoint.
    pub(crate) fn generate_service(&self, role: PostgresRole) -> Service {
        let load_balancer = self.load_balancer_enabled(role);
        let source_ranges = (load_balancer && !self.spec.allowed_source_ranges.is_empty())
            .then(|| self.spec.allowed_source_ranges.clone());

        Service {
            metadata: self.object_meta(self.service_name(role), self.service_labels(role)),
            spec: Some(ServiceSpec {
                type_: Some(if load_balancer { "LoadBalancer" } else { "ClusterIP" }.to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("postgresql".to_string()),
                    port: i32::from(POSTGRES_PORT),
                    target_port: Some(IntOrString::Int(i32::from(POSTGRES_PORT))),
                    ..Default::default()
                }]),
                selector: match role {
                    PostgresRole::Master => None,
                    PostgresRole::Replica => Some(self.role_labels(PostgresRole::Replica)),
                },
                load_balancer_source_ranges: source_ranges,
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Empty endpoint placeholder; Patroni fills in the addresses.
    pub(crate) fn generate_endpoint(&self, role: PostgresRole) -> Endpoints {
        Endpoints {
            metadata: self.object_meta(self.endpoint_name(role), self.service_labels(role)),
            subsets: None,
        }
    }

    pub(crate) fn generate_pod_disruption_budget(&self) -> PodDisruptionBudget {
        let min_available = if self.number_of_instances() > 0 { 1 } else { 0 };
        PodDisruptionBudget {
            metadata: self.object_meta(self.pod_disruption_budget_name(), self.labels()),
            spec: Some(PodDisruptionBudgetSpec {
                min_available: Some(IntOrString::Int(min_available)),
                selector: Some(LabelSelector {
                    match_labels: Some(self.role_labels(PostgresRole::Master)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Credential secret for one user.
    pub(crate) fn generate_user_secret(&self, username: &str, password: &str) -> Secret {
        let data = BTreeMap::from([
            ("username".to_string(), ByteString(username.as_bytes().to_vec())),
            ("password".to_string(), ByteString(password.as_bytes().to_vec())),
        ]);
        Secret {
            metadata: self.object_meta(
                self.config.secret_name(username, &self.name),
                self.labels(),
            ),
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn secret_env(&self, name: &str, username: &str, key: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: self.config.secret_name(username, &self.name),
                    key: key.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        }
    }

    fn field_env(name: &str, path: &str) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: Some("v1".to_string()),
                    field_path: path.to_string(),
                }),
                ..Default::default()
            }),
        }
    }

    fn value_env(name: &str, value: impl Into<String>) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    fn container_env(&self) -> Result<Vec<EnvVar>, ControllerError> {
        let mut env = vec![
            Self::value_env("SCOPE", self.name.clone()),
            Self::value_env("PGROOT", format!("{}/pgroot", DATA_VOLUME_PATH)),
            Self::field_env("POD_IP", "status.podIP"),
            Self::field_env("POD_NAMESPACE", "metadata.namespace"),
            Self::value_env("PGVERSION", self.spec.postgresql.version.clone()),
        ];

        for (key, prefix) in [
            (SystemUser::Superuser, "SUPERUSER"),
            (SystemUser::Replication, "STANDBY"),
        ] {
            let username = match key {
                SystemUser::Superuser => &self.config.super_username,
                SystemUser::Replication => &self.config.replication_username,
            };
            env.push(Self::value_env(&format!("PGUSER_{}", prefix), username.clone()));
            env.push(self.secret_env(&format!("PGPASSWORD_{}", prefix), username, "password"));
        }

        if !self.spec.postgresql.parameters.is_empty() {
            let configuration = serde_json::json!({
                "postgresql": { "parameters": self.spec.postgresql.parameters }
            });
            let configuration = serde_json::to_string(&configuration).map_err(|e| {
                ControllerError::Validation(format!("could not encode Spilo configuration: {}", e))
            })?;
            env.push(Self::value_env("SPILO_CONFIGURATION", configuration));
        }
        Ok(env)
    }

    fn container_resources(&self) -> Option<ResourceRequirements> {
        let resources = self.spec.resources.as_ref()?;
        let to_map = |description: &Option<crds::ResourceDescription>| {
            description.as_ref().map(|d| {
                let mut map = BTreeMap::new();
                if let Some(cpu) = &d.cpu {
                    map.insert("cpu".to_string(), Quantity(cpu.clone()));
                }
                if let Some(memory) = &d.memory {
                    map.insert("memory".to_string(), Quantity(memory.clone()));
                }
                map
            })
        };
        Some(ResourceRequirements {
            requests: to_map(&resources.requests),
            limits: to_map(&resources.limits),
            ..Default::default()
        })
    }

    fn volume_claim_template(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME_NAME.to_string()),
                labels: Some(self.selector_labels()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.spec.volume.size.clone()),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: self.spec.volume.storage_class.clone(),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Desired StatefulSet. Fails when the cluster manifest cannot be turned into one.
    pub(crate) fn generate_statefulset(&self) -> Result<StatefulSet, ControllerError> {
        if self.number_of_instances() < 0 {
            return Err(ControllerError::Validation(format!(
                "number of instances must not be negative, got {}",
                self.number_of_instances()
            )));
        }
        parse_quantity_bytes(&self.spec.volume.size).map_err(|e| {
            ControllerError::Validation(format!("volume size {:?}: {}", self.spec.volume.size, e))
        })?;

        let image = self
            .spec
            .docker_image
            .clone()
            .unwrap_or_else(|| self.config.docker_image.clone());

        let container = Container {
            name: "postgres".to_string(),
            image: Some(image),
            ports: Some(vec![
                ContainerPort {
                    name: Some(PATRONI_PORT_NAME.to_string()),
                    container_port: i32::from(self.config.patroni_api_port),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("postgresql".to_string()),
                    container_port: i32::from(POSTGRES_PORT),
                    ..Default::default()
                },
            ]),
            env: Some(self.container_env()?),
            resources: self.container_resources(),
            volume_mounts: Some(vec![VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: DATA_VOLUME_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let grace_period = i64::try_from(self.config.pod_termination_grace_period.as_secs())
            .map_err(|_| {
                ControllerError::Validation("pod termination grace period is too large".to_string())
            })?;

        Ok(StatefulSet {
            metadata: self.object_meta(self.statefulset_name(), self.labels()),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.number_of_instances()),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels()),
                    ..Default::default()
                },
                service_name: Some(self.service_name(PostgresRole::Master)),
                pod_management_policy: Some("OrderedReady".to_string()),
                update_strategy: Some(StatefulSetUpdateStrategy {
                    type_: Some("OnDelete".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.config.pod_service_account_name.clone()),
                        termination_grace_period_seconds: Some(grace_period),
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![self.volume_claim_template()]),
                ..Default::default()
            }),
            status: None,
        })
    }
}
