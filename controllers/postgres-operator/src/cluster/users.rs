//! In-memory user records and the role diff.
//!
//! Users come from three places: the operator's system users (superuser and
//! replication), the cluster manifest, and the infrastructure roles secret.
//! `produce_sync_requests` diffs the declared users against the roles read
//! from the database and classifies the result into create / alter / rename /
//! drop requests.

use super::credentials::{generate_password, password_matches, PASSWORD_LENGTH};
use super::Cluster;
use crate::error::ControllerError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Comment prefix marking roles owned by this operator
pub const ROLE_COMMENT_PREFIX: &str = "managed-by:postgres-operator:";

/// Suffix given to roles removed from the manifest when deprecation is on
pub const DEPRECATED_ROLE_SUFFIX: &str = "_deleted";

const ROLE_ATTRIBUTES: [&str; 7] = [
    "SUPERUSER",
    "INHERIT",
    "LOGIN",
    "CREATEROLE",
    "CREATEDB",
    "REPLICATION",
    "BYPASSRLS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemUser {
    Superuser,
    Replication,
}

/// Where a user record comes from; decides which side wins on secret conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleOrigin {
    System,
    Infrastructure,
    Manifest,
}

impl RoleOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleOrigin::System => "system",
            RoleOrigin::Infrastructure => "infrastructure",
            RoleOrigin::Manifest => "manifest",
        }
    }

    /// Role comment tagging a role created for this origin.
    pub fn role_comment(&self) -> String {
        format!("{}{}", ROLE_COMMENT_PREFIX, self.as_str())
    }

    /// Origin encoded in a role comment, if the role is operator-managed.
    pub fn from_role_comment(comment: &str) -> Option<Self> {
        match comment.strip_prefix(ROLE_COMMENT_PREFIX)? {
            "system" => Some(RoleOrigin::System),
            "infrastructure" => Some(RoleOrigin::Infrastructure),
            "manifest" => Some(RoleOrigin::Manifest),
            _ => None,
        }
    }
}

/// A database role the cluster declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgUser {
    pub name: String,
    pub password: String,
    pub flags: BTreeSet<String>,
    pub member_of: BTreeSet<String>,
    pub parameters: BTreeMap<String, String>,
    pub origin: RoleOrigin,
}

/// A role as read from `pg_authid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbRole {
    pub name: String,
    /// Stored password verifier (`rolpassword`)
    pub password: Option<String>,
    /// Attributes as positive or `NO`-prefixed flags, one per attribute
    pub flags: BTreeSet<String>,
    pub member_of: BTreeSet<String>,
    pub parameters: BTreeMap<String, String>,
    /// Set when the role carries this operator's comment
    pub origin: Option<RoleOrigin>,
}

impl DbRole {
    /// Flag set for the boolean attributes of `pg_authid`, in the order of
    /// `SUPERUSER, INHERIT, LOGIN, CREATEROLE, CREATEDB, REPLICATION, BYPASSRLS`.
    pub fn flags_from_attributes(attributes: [bool; 7]) -> BTreeSet<String> {
        ROLE_ATTRIBUTES
            .iter()
            .zip(attributes)
            .map(|(name, set)| {
                if set {
                    name.to_string()
                } else {
                    format!("NO{}", name)
                }
            })
            .collect()
    }
}

/// One step of role convergence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Create(PgUser),
    Alter {
        user: PgUser,
        /// Flags missing from the role
        flags: BTreeSet<String>,
        password: bool,
        grants: BTreeSet<String>,
        parameters: BTreeMap<String, String>,
    },
    Rename {
        from: String,
        to: String,
        disable_login: bool,
    },
    Drop {
        name: String,
    },
}

impl SyncRequest {
    pub fn describe(&self) -> String {
        match self {
            SyncRequest::Create(user) => format!("create role {:?}", user.name),
            SyncRequest::Alter { user, .. } => format!("alter role {:?}", user.name),
            SyncRequest::Rename { from, to, .. } => format!("rename role {:?} to {:?}", from, to),
            SyncRequest::Drop { name } => format!("drop role {:?}", name),
        }
    }
}

/// Upper-cases and validates manifest flags; `LOGIN` is implied unless
/// `NOLOGIN` is given.
pub fn normalize_user_flags(flags: &[String]) -> Result<BTreeSet<String>, ControllerError> {
    let mut normalized = BTreeSet::new();
    for flag in flags {
        let flag = flag.trim().to_uppercase();
        let attribute = flag.strip_prefix("NO").unwrap_or(&flag);
        if !ROLE_ATTRIBUTES.contains(&attribute) {
            return Err(ControllerError::Validation(format!(
                "user flag {:?} is not a role attribute",
                flag
            )));
        }
        normalized.insert(flag);
    }

    if normalized.contains("LOGIN") && normalized.contains("NOLOGIN") {
        return Err(ControllerError::Validation(
            "conflicting user flags LOGIN and NOLOGIN".to_string(),
        ));
    }
    if !normalized.contains("NOLOGIN") {
        normalized.insert("LOGIN".to_string());
    }
    Ok(normalized)
}

fn valid_role_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Diffs declared users against database roles.
///
/// `db_roles` holds the declared names found in the database, their
/// `_deleted` twins and every role carrying the operator comment.
pub fn produce_sync_requests(
    db_roles: &BTreeMap<String, DbRole>,
    desired: &BTreeMap<String, PgUser>,
    deprecate_removed: bool,
) -> Vec<SyncRequest> {
    let mut requests = Vec::new();

    for (name, user) in desired {
        if let Some(role) = db_roles.get(name) {
            if let Some(alter) = alter_request(role, user) {
                requests.push(alter);
            }
            continue;
        }

        let deprecated = format!("{}{}", name, DEPRECATED_ROLE_SUFFIX);
        match db_roles.get(&deprecated) {
            Some(role) if role.origin.is_some() => {
                requests.push(SyncRequest::Rename {
                    from: deprecated.clone(),
                    to: name.clone(),
                    disable_login: false,
                });
                if let Some(alter) = alter_request(role, user) {
                    requests.push(alter);
                }
            }
            _ => requests.push(SyncRequest::Create(user.clone())),
        }
    }

    for (name, role) in db_roles {
        let managed = matches!(
            role.origin,
            Some(RoleOrigin::Manifest | RoleOrigin::Infrastructure)
        );
        if !managed || desired.contains_key(name) || name.ends_with(DEPRECATED_ROLE_SUFFIX) {
            continue;
        }
        if deprecate_removed {
            requests.push(SyncRequest::Rename {
                from: name.clone(),
                to: format!("{}{}", name, DEPRECATED_ROLE_SUFFIX),
                disable_login: true,
            });
        } else {
            requests.push(SyncRequest::Drop { name: name.clone() });
        }
    }

    requests
}

fn alter_request(role: &DbRole, user: &PgUser) -> Option<SyncRequest> {
    let flags: BTreeSet<String> = user.flags.difference(&role.flags).cloned().collect();
    let password = !user.password.is_empty()
        && !password_matches(role.password.as_deref(), &user.password);
    let grants: BTreeSet<String> = user.member_of.difference(&role.member_of).cloned().collect();
    let parameters: BTreeMap<String, String> = user
        .parameters
        .iter()
        .filter(|(k, v)| role.parameters.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if flags.is_empty() && !password && grants.is_empty() && parameters.is_empty() {
        return None;
    }
    Some(SyncRequest::Alter {
        user: user.clone(),
        flags,
        password,
        grants,
        parameters,
    })
}

fn retained_password(existing: Option<&PgUser>) -> String {
    existing
        .map(|u| u.password.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH))
}

impl Cluster {
    /// Builds the in-memory user records for this pass. Passwords of users
    /// already known from a previous pass are kept.
    pub(crate) async fn init_users(&mut self) -> Result<(), ControllerError> {
        self.init_system_users();

        let mut users = BTreeMap::new();
        self.init_manifest_users(&mut users)?;
        self.init_infrastructure_roles(&mut users).await?;

        debug!(
            "cluster {}/{} declares {} roles",
            self.namespace,
            self.name,
            users.len()
        );
        self.pg_users = users;
        Ok(())
    }

    fn init_system_users(&mut self) {
        let system = [
            (
                SystemUser::Superuser,
                self.config.super_username.clone(),
                ["SUPERUSER", "LOGIN"],
            ),
            (
                SystemUser::Replication,
                self.config.replication_username.clone(),
                ["REPLICATION", "LOGIN"],
            ),
        ];

        for (key, name, flags) in system {
            let existing = self.system_users.get(&key).filter(|u| u.name == name);
            let user = PgUser {
                password: retained_password(existing),
                name,
                flags: flags.iter().map(|f| f.to_string()).collect(),
                member_of: BTreeSet::new(),
                parameters: BTreeMap::new(),
                origin: RoleOrigin::System,
            };
            self.system_users.insert(key, user);
        }
    }

    pub(crate) fn is_system_username(&self, name: &str) -> bool {
        self.system_users.values().any(|u| u.name == name)
    }

    fn init_manifest_users(
        &self,
        users: &mut BTreeMap<String, PgUser>,
    ) -> Result<(), ControllerError> {
        for (name, flags) in &self.spec.users {
            if self.is_system_username(name) {
                warn!(
                    "cluster {}/{}: manifest role {:?} is reserved for the operator, skipping",
                    self.namespace, self.name, name
                );
                continue;
            }
            if !valid_role_name(name) {
                return Err(ControllerError::Validation(format!(
                    "invalid role name {:?}",
                    name
                )));
            }
            let flags = normalize_user_flags(flags).map_err(|e| {
                ControllerError::Validation(format!("invalid flags for user {:?}: {}", name, e))
            })?;

            users.insert(
                name.clone(),
                PgUser {
                    name: name.clone(),
                    password: retained_password(self.pg_users.get(name)),
                    flags,
                    member_of: BTreeSet::new(),
                    parameters: BTreeMap::new(),
                    origin: RoleOrigin::Manifest,
                },
            );
        }
        Ok(())
    }

    /// Reads `userN` / `passwordN` / `inroleN` triples from the
    /// infrastructure roles secret. A missing secret is not an error.
    async fn init_infrastructure_roles(
        &self,
        users: &mut BTreeMap<String, PgUser>,
    ) -> Result<(), ControllerError> {
        let Some(secret_name) = self.config.infrastructure_roles_secret.as_deref() else {
            return Ok(());
        };

        let secret = match self.backends.kube.secrets.get(secret_name).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                warn!(
                    "infrastructure roles secret {}/{} not found",
                    self.namespace, secret_name
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let data = secret.data.unwrap_or_default();
        let value = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut indexes: Vec<u32> = data
            .keys()
            .filter_map(|k| k.strip_prefix("user")?.parse().ok())
            .collect();
        indexes.sort_unstable();

        for index in indexes {
            let Some(name) = value(&format!("user{}", index)) else {
                continue;
            };
            let Some(password) = value(&format!("password{}", index)) else {
                warn!("infrastructure role {:?} has no password, skipping", name);
                continue;
            };
            if self.is_system_username(&name) {
                warn!("infrastructure role {:?} is reserved for the operator, skipping", name);
                continue;
            }
            let member_of = value(&format!("inrole{}", index))
                .map(|roles| {
                    roles
                        .split(',')
                        .map(|r| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            if users.contains_key(&name) {
                info!("infrastructure role {:?} overrides the manifest role", name);
            }
            users.insert(
                name.clone(),
                PgUser {
                    name,
                    password,
                    flags: BTreeSet::from(["LOGIN".to_string()]),
                    member_of,
                    parameters: BTreeMap::new(),
                    origin: RoleOrigin::Infrastructure,
                },
            );
        }
        Ok(())
    }
}
