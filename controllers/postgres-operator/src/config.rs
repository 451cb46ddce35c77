//! Operator configuration loaded from environment variables.

use crate::error::ControllerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default Spilo image used when a cluster does not override it
pub const DEFAULT_DOCKER_IMAGE: &str = "ghcr.io/zalando/spilo-16:3.3-p3";

/// Which volume resizer the operator runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeResizerKind {
    /// Grow through the claim's storage request (CSI volume expansion)
    Pvc,
    /// Never resize
    None,
}

impl FromStr for VolumeResizerKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pvc" => Ok(VolumeResizerKind::Pvc),
            "none" | "" => Ok(VolumeResizerKind::None),
            other => Err(ControllerError::InvalidConfig(format!(
                "unknown VOLUME_RESIZER {:?} (expected \"pvc\" or \"none\")",
                other
            ))),
        }
    }
}

/// Operator-wide settings shared by every cluster.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub watch_namespace: Option<String>,
    pub dry_run: bool,
    pub enable_database_access: bool,
    pub super_username: String,
    pub replication_username: String,
    pub infrastructure_roles_secret: Option<String>,
    pub secret_name_template: String,
    pub docker_image: String,
    pub pod_service_account_name: String,
    pub pod_termination_grace_period: Duration,
    pub resource_check_interval: Duration,
    pub resource_check_timeout: Duration,
    pub pod_label_wait_timeout: Duration,
    pub patroni_api_port: u16,
    pub volume_resizer: VolumeResizerKind,
    pub enable_role_deprecation: bool,
    pub resync_period: Duration,
    pub probe_addr: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            dry_run: false,
            enable_database_access: true,
            super_username: "postgres".to_string(),
            replication_username: "standby".to_string(),
            infrastructure_roles_secret: None,
            secret_name_template: "{username}.{cluster}.credentials".to_string(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            pod_service_account_name: "postgres-pod".to_string(),
            pod_termination_grace_period: Duration::from_secs(300),
            resource_check_interval: Duration::from_secs(3),
            resource_check_timeout: Duration::from_secs(600),
            pod_label_wait_timeout: Duration::from_secs(600),
            patroni_api_port: 8008,
            volume_resizer: VolumeResizerKind::Pvc,
            enable_role_deprecation: true,
            resync_period: Duration::from_secs(1800),
            probe_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            dry_run: parse_var(&lookup, "DRY_RUN", defaults.dry_run)?,
            enable_database_access: parse_var(
                &lookup,
                "ENABLE_DATABASE_ACCESS",
                defaults.enable_database_access,
            )?,
            super_username: string("SUPER_USERNAME", defaults.super_username),
            replication_username: string("REPLICATION_USERNAME", defaults.replication_username),
            infrastructure_roles_secret: lookup("INFRASTRUCTURE_ROLES_SECRET")
                .filter(|name| !name.is_empty()),
            secret_name_template: string("SECRET_NAME_TEMPLATE", defaults.secret_name_template),
            docker_image: string("DOCKER_IMAGE", defaults.docker_image),
            pod_service_account_name: string(
                "POD_SERVICE_ACCOUNT_NAME",
                defaults.pod_service_account_name,
            ),
            pod_termination_grace_period: parse_secs(
                &lookup,
                "POD_TERMINATION_GRACE_PERIOD_SECS",
                defaults.pod_termination_grace_period,
            )?,
            resource_check_interval: parse_secs(
                &lookup,
                "RESOURCE_CHECK_INTERVAL_SECS",
                defaults.resource_check_interval,
            )?,
            resource_check_timeout: parse_secs(
                &lookup,
                "RESOURCE_CHECK_TIMEOUT_SECS",
                defaults.resource_check_timeout,
            )?,
            pod_label_wait_timeout: parse_secs(
                &lookup,
                "POD_LABEL_WAIT_TIMEOUT_SECS",
                defaults.pod_label_wait_timeout,
            )?,
            patroni_api_port: parse_var(&lookup, "PATRONI_API_PORT", defaults.patroni_api_port)?,
            volume_resizer: parse_var(&lookup, "VOLUME_RESIZER", defaults.volume_resizer)?,
            enable_role_deprecation: parse_var(
                &lookup,
                "ENABLE_ROLE_DEPRECATION",
                defaults.enable_role_deprecation,
            )?,
            resync_period: parse_secs(&lookup, "RESYNC_PERIOD_SECS", defaults.resync_period)?,
            probe_addr: string("PROBE_ADDR", defaults.probe_addr),
        })
    }

    /// Credential secret name for a user of a cluster.
    pub fn secret_name(&self, username: &str, cluster: &str) -> String {
        self.secret_name_template
            .replace("{username}", &username.replace('_', "-"))
            .replace("{cluster}", cluster)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            ControllerError::InvalidConfig(format!("{} has an invalid value: {:?}", key, raw))
        }),
        _ => Ok(default),
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ControllerError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, key, default.as_secs()).map(Duration::from_secs)
}
