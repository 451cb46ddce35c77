//! Credential secret convergence.
//!
//! Every user gets one secret. On a name clash the origin of the user
//! decides which side wins: infrastructure roles overwrite the secret, every
//! other user adopts the password stored in it.

use super::users::{PgUser, RoleOrigin, SystemUser};
use super::{name_from_meta, Cluster};
use crate::error::ControllerError;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
}

/// Which in-memory record a secret belongs to.
enum UserKey {
    System(SystemUser),
    Declared(String),
}

impl Cluster {
    /// Desired secret per username.
    fn user_secrets(&self) -> BTreeMap<String, Secret> {
        self.system_users
            .values()
            .chain(self.pg_users.values())
            .filter(|u| !u.password.is_empty())
            .map(|u| (u.name.clone(), self.generate_user_secret(&u.name, &u.password)))
            .collect()
    }

    fn user_key(&self, username: &str) -> UserKey {
        self.system_users
            .iter()
            .find(|(_, u)| u.name == username)
            .map(|(key, _)| UserKey::System(*key))
            .unwrap_or_else(|| UserKey::Declared(username.to_string()))
    }

    fn user_mut(&mut self, key: &UserKey) -> Option<&mut PgUser> {
        match key {
            UserKey::System(system) => self.system_users.get_mut(system),
            UserKey::Declared(name) => self.pg_users.get_mut(name),
        }
    }

    pub(crate) async fn sync_secrets(&mut self) -> Result<(), ControllerError> {
        let store = self.backends.kube.secrets.clone();

        for (username, desired) in self.user_secrets() {
            match store.create(&desired).await {
                Ok(secret) => {
                    debug!(
                        "created new secret {}, uid: {:?}",
                        name_from_meta(&secret.metadata),
                        secret.metadata.uid
                    );
                    if let Some(uid) = secret.metadata.uid.clone() {
                        self.observed.secrets.insert(uid, secret);
                    }
                }
                Err(e) if e.is_already_exists() => {
                    self.reconcile_existing_secret(&username, desired).await?;
                }
                Err(e) => {
                    warn!("could not create secret for user {:?}: {}", username, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn reconcile_existing_secret(
        &mut self,
        username: &str,
        mut desired: Secret,
    ) -> Result<(), ControllerError> {
        let store = self.backends.kube.secrets.clone();
        let name = desired.metadata.name.clone().unwrap_or_default();
        let current = store.get(&name).await?;

        if secret_value(&current, "username").as_deref() != Some(username) {
            warn!(
                "secret {} does not contain the role {:?}",
                name_from_meta(&current.metadata),
                username
            );
            return Ok(());
        }
        debug!(
            "secret {} already exists, fetching its password",
            name_from_meta(&current.metadata)
        );

        let key = self.user_key(username);
        let stored_password = secret_value(&current, "password");
        let Some(user) = self.user_mut(&key) else {
            return Ok(());
        };

        if user.origin == RoleOrigin::Infrastructure
            && stored_password.as_deref() != Some(user.password.as_str())
        {
            info!(
                "updating secret {} from the infrastructure roles",
                name_from_meta(&current.metadata)
            );
            desired.metadata.resource_version = current.metadata.resource_version.clone();
            store.update(&desired).await?;
        } else if let Some(password) = stored_password {
            user.password = password;
        }
        Ok(())
    }
}
