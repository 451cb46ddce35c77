//! Database-level convergence: roles and database ownership.
//!
//! Role sync and database sync each open their own connection to the
//! primary and close it on every exit path. Statements run one at a time;
//! the first failing statement aborts the rest of the stage.

use super::credentials::scram_sha256_verifier;
use super::users::{produce_sync_requests, DbRole, PgUser, RoleOrigin, SyncRequest, SystemUser};
use super::{Cluster, PostgresRole};
use crate::error::ControllerError;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const POSTGRES_PORT: u16 = 5432;
const MAINTENANCE_DATABASE: &str = "postgres";

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Opens connections to a cluster's primary.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn DatabaseConnection>, ControllerError>;
}

/// One open connection.
#[async_trait]
pub trait DatabaseConnection: Send {
    /// Roles named in `names` plus every role carrying the operator comment.
    async fn read_roles(&mut self, names: &[String]) -> Result<Vec<DbRole>, ControllerError>;

    /// Database name -> owner for every connectable, non-template database.
    async fn read_databases(&mut self) -> Result<BTreeMap<String, String>, ControllerError>;

    async fn execute(&mut self, statement: &str) -> Result<(), ControllerError>;

    async fn close(self: Box<Self>) -> Result<(), ControllerError>;
}

/// `sqlx`-backed connector.
#[derive(Debug, Default, Clone)]
pub struct SqlxConnector;

#[async_trait]
impl DatabaseConnector for SqlxConnector {
    async fn connect(
        &self,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn DatabaseConnection>, ControllerError> {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(&target.password)
            .database(&target.database)
            .ssl_mode(PgSslMode::Prefer)
            .application_name("postgres-operator")
            .disable_statement_logging();
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Box::new(SqlxConnection { conn }))
    }
}

struct SqlxConnection {
    conn: PgConnection,
}

const ROLES_QUERY: &str = r#"
SELECT a.rolname::text AS rolname,
       a.rolpassword::text AS rolpassword,
       a.rolsuper, a.rolinherit, a.rolcanlogin, a.rolcreaterole,
       a.rolcreatedb, a.rolreplication, a.rolbypassrls,
       COALESCE(a.rolconfig, ARRAY[]::text[]) AS rolconfig,
       ARRAY(SELECT b.rolname::text
               FROM pg_catalog.pg_auth_members m
               JOIN pg_catalog.pg_authid b ON m.roleid = b.oid
              WHERE m.member = a.oid) AS memberof,
       pg_catalog.shobj_description(a.oid, 'pg_authid') AS description
  FROM pg_catalog.pg_authid a
 WHERE a.rolname = ANY($1)
    OR pg_catalog.shobj_description(a.oid, 'pg_authid') LIKE 'managed-by:postgres-operator:%'
 ORDER BY 1"#;

const DATABASES_QUERY: &str = r#"
SELECT datname::text AS datname,
       pg_catalog.pg_get_userbyid(datdba)::text AS owner
  FROM pg_catalog.pg_database
 WHERE datallowconn AND NOT datistemplate"#;

#[async_trait]
impl DatabaseConnection for SqlxConnection {
    async fn read_roles(&mut self, names: &[String]) -> Result<Vec<DbRole>, ControllerError> {
        let rows = sqlx::query(ROLES_QUERY)
            .bind(names)
            .fetch_all(&mut self.conn)
            .await?;

        let mut roles = Vec::with_capacity(rows.len());
        for row in rows {
            let attributes = [
                row.try_get::<bool, _>("rolsuper")?,
                row.try_get::<bool, _>("rolinherit")?,
                row.try_get::<bool, _>("rolcanlogin")?,
                row.try_get::<bool, _>("rolcreaterole")?,
                row.try_get::<bool, _>("rolcreatedb")?,
                row.try_get::<bool, _>("rolreplication")?,
                row.try_get::<bool, _>("rolbypassrls")?,
            ];
            let config: Vec<String> = row.try_get("rolconfig")?;
            let description: Option<String> = row.try_get("description")?;

            roles.push(DbRole {
                name: row.try_get("rolname")?,
                password: row.try_get("rolpassword")?,
                flags: DbRole::flags_from_attributes(attributes),
                member_of: row.try_get::<Vec<String>, _>("memberof")?.into_iter().collect(),
                parameters: config
                    .iter()
                    .filter_map(|kv| kv.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                origin: description.as_deref().and_then(RoleOrigin::from_role_comment),
            });
        }
        Ok(roles)
    }

    async fn read_databases(&mut self) -> Result<BTreeMap<String, String>, ControllerError> {
        let rows = sqlx::query(DATABASES_QUERY).fetch_all(&mut self.conn).await?;
        let mut databases = BTreeMap::new();
        for row in rows {
            let name: String = row.try_get("datname")?;
            let owner: String = row.try_get("owner")?;
            databases.insert(name, owner);
        }
        Ok(databases)
    }

    async fn execute(&mut self, statement: &str) -> Result<(), ControllerError> {
        sqlx::query(statement).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), ControllerError> {
        let SqlxConnection { conn } = *self;
        conn.close().await?;
        Ok(())
    }
}

/// Double-quoted SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quoted SQL literal.
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

/// Statements carrying out one role request, in execution order.
pub fn role_statements(request: &SyncRequest) -> Result<Vec<String>, ControllerError> {
    let mut statements = Vec::new();
    match request {
        SyncRequest::Create(user) => {
            let mut attributes: Vec<String> = user.flags.iter().cloned().collect();
            if !user.password.is_empty() {
                attributes.push("PASSWORD".to_string());
                attributes.push(quote_literal(&scram_sha256_verifier(&user.password)?));
            }
            statements.push(format!(
                "CREATE ROLE {} WITH {}",
                quote_ident(&user.name),
                attributes.join(" ")
            ));
            statements.extend(grant_statements(&user.name, user.member_of.iter()));
            statements.extend(parameter_statements(&user.name, &user.parameters));
            statements.push(comment_statement(user));
        }
        SyncRequest::Alter {
            user,
            flags,
            password,
            grants,
            parameters,
        } => {
            let mut attributes: Vec<String> = flags.iter().cloned().collect();
            if *password {
                attributes.push("PASSWORD".to_string());
                attributes.push(quote_literal(&scram_sha256_verifier(&user.password)?));
            }
            if !attributes.is_empty() {
                statements.push(format!(
                    "ALTER ROLE {} WITH {}",
                    quote_ident(&user.name),
                    attributes.join(" ")
                ));
            }
            statements.extend(grant_statements(&user.name, grants.iter()));
            statements.extend(parameter_statements(&user.name, parameters));
        }
        SyncRequest::Rename {
            from,
            to,
            disable_login,
        } => {
            statements.push(format!(
                "ALTER ROLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ));
            if *disable_login {
                statements.push(format!("ALTER ROLE {} WITH NOLOGIN", quote_ident(to)));
            }
        }
        SyncRequest::Drop { name } => {
            statements.push(format!("DROP ROLE IF EXISTS {}", quote_ident(name)));
        }
    }
    Ok(statements)
}

fn grant_statements<'a>(
    name: &'a str,
    roles: impl Iterator<Item = &'a String> + 'a,
) -> impl Iterator<Item = String> + 'a {
    roles.map(move |role| format!("GRANT {} TO {}", quote_ident(role), quote_ident(name)))
}

fn parameter_statements(name: &str, parameters: &BTreeMap<String, String>) -> Vec<String> {
    parameters
        .iter()
        .map(|(k, v)| {
            format!(
                "ALTER ROLE {} SET {} TO {}",
                quote_ident(name),
                quote_ident(k),
                quote_literal(v)
            )
        })
        .collect()
}

fn comment_statement(user: &PgUser) -> String {
    format!(
        "COMMENT ON ROLE {} IS {}",
        quote_ident(&user.name),
        quote_literal(&user.origin.role_comment())
    )
}

pub fn create_database_statement(name: &str, owner: &str) -> String {
    format!("CREATE DATABASE {} OWNER {}", quote_ident(name), quote_ident(owner))
}

pub fn alter_database_owner_statement(name: &str, owner: &str) -> String {
    format!("ALTER DATABASE {} OWNER TO {}", quote_ident(name), quote_ident(owner))
}

/// Create / alter-owner statements turning `observed` into `declared`.
/// Databases missing from `declared` are never touched.
pub fn database_statements(
    observed: &BTreeMap<String, String>,
    declared: &BTreeMap<String, String>,
) -> Vec<String> {
    declared
        .iter()
        .filter_map(|(name, owner)| match observed.get(name) {
            None => Some(create_database_statement(name, owner)),
            Some(current) if current != owner => Some(alter_database_owner_statement(name, owner)),
            Some(_) => None,
        })
        .collect()
}

impl Cluster {
    fn connection_target(&self) -> Result<ConnectionTarget, ControllerError> {
        let superuser = self.system_users.get(&SystemUser::Superuser).ok_or_else(|| {
            ControllerError::Validation("superuser credentials are not initialized".to_string())
        })?;
        Ok(ConnectionTarget {
            host: format!(
                "{}.{}.svc",
                self.service_name(PostgresRole::Master),
                self.namespace
            ),
            port: POSTGRES_PORT,
            user: superuser.name.clone(),
            password: superuser.password.clone(),
            database: MAINTENANCE_DATABASE.to_string(),
        })
    }

    async fn open_db_connection(&self) -> Result<Box<dyn DatabaseConnection>, ControllerError> {
        let target = self.connection_target()?;
        debug!("opening database connection to {}:{}", target.host, target.port);
        self.backends.database.connect(&target).await
    }

    async fn close_db_connection(&self, conn: Box<dyn DatabaseConnection>) {
        if let Err(e) = conn.close().await {
            warn!(
                "cluster {}/{}: could not close database connection: {}",
                self.namespace, self.name, e
            );
        }
    }

    /// Converges database roles against the declared users.
    pub(crate) async fn sync_roles(&mut self) -> Result<(), ControllerError> {
        let mut conn = self.open_db_connection().await?;
        let result = self.sync_roles_on(conn.as_mut()).await;
        self.close_db_connection(conn).await;
        result
    }

    async fn sync_roles_on(&self, conn: &mut dyn DatabaseConnection) -> Result<(), ControllerError> {
        let mut names: Vec<String> = self.pg_users.keys().cloned().collect();
        names.extend(
            self.pg_users
                .keys()
                .map(|n| format!("{}{}", n, super::users::DEPRECATED_ROLE_SUFFIX)),
        );

        let db_roles: BTreeMap<String, DbRole> = conn
            .read_roles(&names)
            .await?
            .into_iter()
            .filter(|r| !self.is_system_username(&r.name))
            .map(|r| (r.name.clone(), r))
            .collect();

        let requests =
            produce_sync_requests(&db_roles, &self.pg_users, self.config.enable_role_deprecation);
        if requests.is_empty() {
            debug!("cluster {}/{}: roles are in sync", self.namespace, self.name);
            return Ok(());
        }

        for request in &requests {
            info!(
                "cluster {}/{}: {}",
                self.namespace,
                self.name,
                request.describe()
            );
            if self.dry_run() {
                continue;
            }
            for statement in role_statements(request)? {
                conn.execute(&statement).await?;
            }
        }
        Ok(())
    }

    /// Creates missing databases and fixes owners; never drops.
    pub(crate) async fn sync_databases(&mut self) -> Result<(), ControllerError> {
        let mut conn = self.open_db_connection().await?;
        let result = self.sync_databases_on(conn.as_mut()).await;
        self.close_db_connection(conn).await;
        result
    }

    async fn sync_databases_on(
        &self,
        conn: &mut dyn DatabaseConnection,
    ) -> Result<(), ControllerError> {
        let observed = conn.read_databases().await?;
        let statements = database_statements(&observed, &self.spec.databases);
        if statements.is_empty() {
            debug!("cluster {}/{}: databases are in sync", self.namespace, self.name);
            return Ok(());
        }

        for statement in statements {
            info!("cluster {}/{}: {}", self.namespace, self.name, statement);
            if !self.dry_run() {
                conn.execute(&statement).await?;
            }
        }
        Ok(())
    }
}
