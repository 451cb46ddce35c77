//! Structural comparators restricted to operator-managed fields.
//!
//! Backends add defaults and status fields to stored objects, so none of
//! these compare whole objects. Labels and annotations match when every
//! desired entry is present with the same value.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, Service};
use crds::{parse_cpu_millis, parse_quantity_bytes};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Outcome of a two-way comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub matches: bool,
    pub reason: String,
}

impl Comparison {
    fn matching() -> Self {
        Self {
            matches: true,
            reason: String::new(),
        }
    }

    fn differs(reason: impl Into<String>) -> Self {
        Self {
            matches: false,
            reason: reason.into(),
        }
    }
}

/// Outcome of comparing a StatefulSet with its desired definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatefulSetComparison {
    pub update: bool,
    /// Immutable fields changed; delete and recreate instead of updating
    pub replace: bool,
    /// Change only reaches pods when they restart
    pub rolling_update: bool,
    pub reasons: Vec<String>,
}

impl StatefulSetComparison {
    pub fn matches(&self) -> bool {
        !self.update && !self.replace
    }
}

fn contains_all(current: Option<&BTreeMap<String, String>>, desired: Option<&BTreeMap<String, String>>) -> bool {
    let Some(desired) = desired else {
        return true;
    };
    desired
        .iter()
        .all(|(k, v)| current.and_then(|c| c.get(k)) == Some(v))
}

fn quantity_value(resource: &str, quantity: &Quantity) -> Option<u64> {
    match resource {
        "cpu" => parse_cpu_millis(&quantity.0).ok(),
        _ => parse_quantity_bytes(&quantity.0).ok(),
    }
}

/// The API server stores quantities in canonical form ("1000m" reads back
/// as "1"), so amounts are compared by value. Unparseable amounts fall back
/// to their spelling.
fn same_quantities(
    current: Option<&BTreeMap<String, Quantity>>,
    desired: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let current = current.unwrap_or(&empty);
    let desired = desired.unwrap_or(&empty);
    current.len() == desired.len()
        && desired.iter().all(|(name, d)| {
            current.get(name).is_some_and(|c| {
                match (quantity_value(name, c), quantity_value(name, d)) {
                    (Some(c), Some(d)) => c == d,
                    _ => c.0 == d.0,
                }
            })
        })
}

fn service_type(service: &Service) -> &str {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or("ClusterIP")
}

fn service_ports(service: &Service) -> Vec<(Option<String>, i32, Option<IntOrString>)> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let target = p.target_port.clone().or(Some(IntOrString::Int(p.port)));
                    (p.name.clone(), p.port, target)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// True when the service type changed, which requires delete and recreate.
pub fn service_type_changed(current: &Service, desired: &Service) -> bool {
    service_type(current) != service_type(desired)
}

pub fn same_service(current: &Service, desired: &Service) -> Comparison {
    if service_type_changed(current, desired) {
        return Comparison::differs(format!(
            "new service's type {:?} does not match the current one {:?}",
            service_type(desired),
            service_type(current)
        ));
    }

    let current_spec = current.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();

    if service_ports(current) != service_ports(desired) {
        return Comparison::differs("new service's ports do not match the current ones");
    }
    if current_spec.selector != desired_spec.selector {
        return Comparison::differs("new service's selector does not match the current one");
    }
    let ranges = |r: Option<Vec<String>>| r.unwrap_or_default();
    if ranges(current_spec.load_balancer_source_ranges)
        != ranges(desired_spec.load_balancer_source_ranges)
    {
        return Comparison::differs(
            "new service's LoadBalancerSourceRange does not match the current one",
        );
    }
    if !contains_all(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref()) {
        return Comparison::differs("new service's labels do not match the current ones");
    }
    if !contains_all(
        current.metadata.annotations.as_ref(),
        desired.metadata.annotations.as_ref(),
    ) {
        return Comparison::differs("new service's annotations do not match the current ones");
    }
    Comparison::matching()
}

/// Compares only the budget specification.
pub fn same_pdb(current: &PodDisruptionBudget, desired: &PodDisruptionBudget) -> Comparison {
    let current_spec = current.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.clone().unwrap_or_default();

    if current_spec.min_available != desired_spec.min_available {
        return Comparison::differs("new PodDisruptionBudget's MinAvailable does not match the current one");
    }
    if current_spec.max_unavailable != desired_spec.max_unavailable {
        return Comparison::differs("new PodDisruptionBudget's MaxUnavailable does not match the current one");
    }
    let match_labels = |s: &Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>| {
        s.as_ref().and_then(|s| s.match_labels.clone()).unwrap_or_default()
    };
    if match_labels(&current_spec.selector) != match_labels(&desired_spec.selector) {
        return Comparison::differs("new PodDisruptionBudget's selector does not match the current one");
    }
    Comparison::matching()
}

fn compare_containers(
    current: &[Container],
    desired: &[Container],
    result: &mut StatefulSetComparison,
) {
    if current.len() != desired.len() {
        result.update = true;
        result.rolling_update = true;
        result.reasons.push(format!(
            "new statefulset's container count {} does not match the current one {}",
            desired.len(),
            current.len()
        ));
        return;
    }

    for (index, (c, d)) in current.iter().zip(desired).enumerate() {
        let mut changed = Vec::new();
        if c.name != d.name {
            changed.push("name");
        }
        if c.image != d.image {
            changed.push("image");
        }
        let ports = |container: &Container| {
            container
                .ports
                .as_ref()
                .map(|ports| {
                    ports
                        .iter()
                        .map(|p| (p.name.clone(), p.container_port))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        if ports(c) != ports(d) {
            changed.push("ports");
        }
        let (current_resources, desired_resources) = (c.resources.as_ref(), d.resources.as_ref());
        if !same_quantities(
            current_resources.and_then(|r| r.requests.as_ref()),
            desired_resources.and_then(|r| r.requests.as_ref()),
        ) || !same_quantities(
            current_resources.and_then(|r| r.limits.as_ref()),
            desired_resources.and_then(|r| r.limits.as_ref()),
        ) {
            changed.push("resources");
        }
        if c.env.clone().unwrap_or_default() != d.env.clone().unwrap_or_default() {
            changed.push("environment");
        }
        if c.volume_mounts.clone().unwrap_or_default() != d.volume_mounts.clone().unwrap_or_default()
        {
            changed.push("volume mounts");
        }

        for field in changed {
            result.update = true;
            result.rolling_update = true;
            result.reasons.push(format!(
                "new statefulset's container {} ({}) {} does not match the current one",
                index, d.name, field
            ));
        }
    }
}

/// Three-way diff of a StatefulSet against its desired definition.
pub fn compare_statefulset(current: &StatefulSet, desired: &StatefulSet) -> StatefulSetComparison {
    let mut result = StatefulSetComparison::default();
    let (Some(current_spec), Some(desired_spec)) = (current.spec.as_ref(), desired.spec.as_ref())
    else {
        result.update = true;
        result.replace = true;
        result.reasons.push("statefulset has no spec".to_string());
        return result;
    };

    if current_spec.replicas != desired_spec.replicas {
        result.update = true;
        result.reasons.push(format!(
            "new statefulset's number of replicas {:?} does not match the current one {:?}",
            desired_spec.replicas, current_spec.replicas
        ));
    }
    if !contains_all(
        current.metadata.annotations.as_ref(),
        desired.metadata.annotations.as_ref(),
    ) {
        result.update = true;
        result
            .reasons
            .push("new statefulset's annotations do not match the current one".to_string());
    }
    if !contains_all(current.metadata.labels.as_ref(), desired.metadata.labels.as_ref()) {
        result.update = true;
        result
            .reasons
            .push("new statefulset's metadata labels do not match the current one".to_string());
    }
    if current_spec.service_name != desired_spec.service_name {
        result.replace = true;
        result
            .reasons
            .push("new statefulset's serviceName does not match the current one".to_string());
    }
    if current_spec.pod_management_policy.as_deref().unwrap_or("OrderedReady")
        != desired_spec.pod_management_policy.as_deref().unwrap_or("OrderedReady")
    {
        result.replace = true;
        result.reasons.push(
            "new statefulset's podManagementPolicy does not match the current one".to_string(),
        );
    }
    if current_spec.selector.match_labels != desired_spec.selector.match_labels {
        result.replace = true;
        result
            .reasons
            .push("new statefulset's selector does not match the current one".to_string());
    }
    let strategy = |s: &k8s_openapi::api::apps::v1::StatefulSetSpec| {
        s.update_strategy
            .as_ref()
            .and_then(|u| u.type_.clone())
            .unwrap_or_else(|| "RollingUpdate".to_string())
    };
    if strategy(current_spec) != strategy(desired_spec) {
        result.update = true;
        result
            .reasons
            .push("new statefulset's updateStrategy does not match the current one".to_string());
    }

    let current_template = &current_spec.template;
    let desired_template = &desired_spec.template;
    let template_labels = |t: &k8s_openapi::api::core::v1::PodTemplateSpec| {
        t.metadata.as_ref().and_then(|m| m.labels.clone()).unwrap_or_default()
    };
    if template_labels(current_template) != template_labels(desired_template) {
        result.replace = true;
        result.rolling_update = true;
        result.reasons.push(
            "new statefulset's pod template metadata labels do not match the current one"
                .to_string(),
        );
    }

    let current_pod = current_template.spec.clone().unwrap_or_default();
    let desired_pod = desired_template.spec.clone().unwrap_or_default();
    if current_pod.service_account_name != desired_pod.service_account_name {
        result.update = true;
        result.rolling_update = true;
        result.reasons.push(
            "new statefulset's serviceAccountName does not match the current one".to_string(),
        );
    }
    if current_pod.termination_grace_period_seconds != desired_pod.termination_grace_period_seconds
    {
        result.update = true;
        result.rolling_update = true;
        result.reasons.push(
            "new statefulset's terminationGracePeriodSeconds does not match the current one"
                .to_string(),
        );
    }
    compare_containers(&current_pod.containers, &desired_pod.containers, &mut result);

    let claim_templates = |s: &k8s_openapi::api::apps::v1::StatefulSetSpec| {
        s.volume_claim_templates
            .as_ref()
            .map(|templates| {
                templates
                    .iter()
                    .map(|t| {
                        let spec = t.spec.clone().unwrap_or_default();
                        (
                            t.metadata.name.clone(),
                            spec.storage_class_name,
                            spec.resources.and_then(|r| r.requests),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };
    let (current_claims, desired_claims) = (claim_templates(current_spec), claim_templates(desired_spec));
    let claims_match = current_claims.len() == desired_claims.len()
        && current_claims.iter().zip(&desired_claims).all(|(c, d)| {
            c.0 == d.0 && c.1 == d.1 && same_quantities(c.2.as_ref(), d.2.as_ref())
        });
    if !claims_match {
        result.replace = true;
        result.reasons.push(
            "new statefulset's volumeClaimTemplates do not match the current one".to_string(),
        );
    }

    if result.replace {
        result.update = true;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn service(type_: &str, port: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("acid-test".to_string()),
                labels: Some(BTreeMap::from([("application".to_string(), "spilo".to_string())])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("postgresql".to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_backend_added_fields_are_ignored() {
        let desired = service("ClusterIP", 5432);
        let mut current = desired.clone();
        let spec = current.spec.as_mut().unwrap();
        spec.cluster_ip = Some("10.96.0.12".to_string());
        spec.ports.as_mut().unwrap()[0].protocol = Some("TCP".to_string());
        spec.ports.as_mut().unwrap()[0].target_port = Some(IntOrString::Int(5432));
        current
            .metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("added-by".to_string(), "someone".to_string());

        assert!(same_service(&current, &desired).matches);
    }

    #[test]
    fn test_port_and_type_changes_are_reported() {
        let current = service("ClusterIP", 5432);

        let result = same_service(&current, &service("ClusterIP", 5433));
        assert!(!result.matches);
        assert!(result.reason.contains("ports"));

        let desired = service("LoadBalancer", 5432);
        assert!(service_type_changed(&current, &desired));
        assert!(same_service(&current, &desired).reason.contains("type"));
    }

    fn statefulset(cpu: &str, memory: &str, storage: &str) -> StatefulSet {
        use k8s_openapi::api::apps::v1::StatefulSetSpec;
        use k8s_openapi::api::core::v1::{
            PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
            ResourceRequirements, VolumeResourceRequirements,
        };
        let quantities = |pairs: &[(&str, &str)]| {
            Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                    .collect::<BTreeMap<_, _>>(),
            )
        };
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("acid-test".to_string()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "postgres".to_string(),
                            resources: Some(ResourceRequirements {
                                requests: quantities(&[("cpu", cpu), ("memory", memory)]),
                                limits: quantities(&[("cpu", cpu), ("memory", memory)]),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some("pgdata".to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        resources: Some(VolumeResourceRequirements {
                            requests: quantities(&[("storage", storage)]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    status: None,
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_canonical_quantities_match_their_alternate_spelling() {
        let current = statefulset("1", "1Gi", "1Ti");
        let desired = statefulset("1000m", "1024Mi", "1024Gi");

        let result = compare_statefulset(&current, &desired);

        assert!(result.matches(), "unexpected differences: {:?}", result.reasons);
        assert!(!result.rolling_update);
    }

    #[test]
    fn test_changed_quantities_are_reported() {
        let current = statefulset("1", "1Gi", "10Gi");

        let result = compare_statefulset(&current, &statefulset("500m", "1Gi", "10Gi"));
        assert!(result.update && result.rolling_update && !result.replace);
        assert!(result.reasons[0].contains("resources"));

        let result = compare_statefulset(&current, &statefulset("1", "1Gi", "20Gi"));
        assert!(result.replace);
        assert!(!result.rolling_update);
    }
}
