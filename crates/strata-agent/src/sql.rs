//! SQL execution against the local database
//!
//! Statements are piped to `psql` on stdin so passwords never show up in
//! the process list. Identifiers are validated and quoted here; nothing
//! from a request reaches SQL text any other way.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use strata_common::agent::{CreateDatabaseRequest, CreateGrantRequest, CreateUserRequest};

use crate::config::ConnectionParams;

const MAX_IDENTIFIER_LEN: usize = 63;
const DOLLAR_TAG: &str = "$strata$";

/// Privileges granted on the database object itself
const DATABASE_PRIVILEGES: &[&str] = &["CONNECT", "CREATE", "TEMPORARY", "TEMP"];

/// Privileges granted on the tables of the database's public schema
const TABLE_PRIVILEGES: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
];

/// Failures building or running SQL
#[derive(Debug, Error)]
pub enum SqlError {
    /// Name is not a plain SQL identifier
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// Privilege is not one the agent grants
    #[error("invalid privilege: {0:?}")]
    InvalidPrivilege(String),

    /// Literal contains characters that cannot be embedded
    #[error("invalid literal value")]
    InvalidLiteral,

    /// `psql` could not be started
    #[error("failed to run psql: {0}")]
    Spawn(#[from] std::io::Error),

    /// `psql` exited with an error
    #[error("psql failed ({code:?}): {stderr}")]
    Failed {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },
}

impl SqlError {
    /// Whether the request itself was unacceptable
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentifier(_) | Self::InvalidPrivilege(_) | Self::InvalidLiteral
        )
    }
}

/// Runs SQL against a database of the local server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run statements in `database`
    async fn execute(&self, database: &str, sql: &str) -> Result<(), SqlError>;

    /// Run a query in `database` and report whether it returned any row
    async fn exists(&self, database: &str, query: &str) -> Result<bool, SqlError>;

    /// Run a SQL script file in `database`
    async fn execute_file(&self, database: &str, path: &Path) -> Result<(), SqlError>;
}

/// [`SqlExecutor`] shelling out to `psql`
#[derive(Debug, Clone)]
pub struct Psql {
    connection: ConnectionParams,
}

impl Psql {
    /// Executor for the given server
    pub fn new(connection: ConnectionParams) -> Self {
        Self { connection }
    }

    fn command(&self, database: &str) -> Command {
        let mut cmd = Command::new("psql");
        cmd.args(self.connection.args())
            .args(["-d", database, "-X", "-q", "-v", "ON_ERROR_STOP=1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, stdin: Option<&str>) -> Result<String, SqlError> {
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(SqlError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SqlExecutor for Psql {
    async fn execute(&self, database: &str, sql: &str) -> Result<(), SqlError> {
        let mut cmd = self.command(database);
        cmd.args(["-f", "-"]);
        self.run(cmd, Some(sql)).await.map(|_| ())
    }

    async fn exists(&self, database: &str, query: &str) -> Result<bool, SqlError> {
        let mut cmd = self.command(database);
        cmd.args(["-t", "-A", "-f", "-"]);
        let stdout = self.run(cmd, Some(query)).await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn execute_file(&self, database: &str, path: &Path) -> Result<(), SqlError> {
        let mut cmd = self.command(database);
        cmd.arg("-f").arg(path);
        self.run(cmd, None).await.map(|_| ())
    }
}

/// Double-quote a validated identifier
pub fn quote_ident(name: &str) -> Result<String, SqlError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(SqlError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

/// Single-quote a string literal
pub fn quote_literal(value: &str) -> Result<String, SqlError> {
    if value.contains('\0') || value.contains(DOLLAR_TAG) {
        return Err(SqlError::InvalidLiteral);
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

/// Grant statements split by the database they must run in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantStatements {
    /// Database-object privileges, run from the maintenance database
    pub server: Option<String>,
    /// Table privileges, run inside the target database
    pub database: Option<String>,
}

/// Build the statements granting `privileges` on `database` to `username`
pub fn grant_statements(
    database: &str,
    username: &str,
    privileges: &[String],
) -> Result<GrantStatements, SqlError> {
    let db = quote_ident(database)?;
    let role = quote_ident(username)?;
    if privileges.is_empty() {
        return Err(SqlError::InvalidPrivilege(String::new()));
    }

    let mut on_database = Vec::new();
    let mut on_tables = Vec::new();
    for privilege in privileges {
        let normalized = privilege.trim().to_uppercase();
        match normalized.as_str() {
            "ALL" | "ALL PRIVILEGES" => {
                on_database.push("ALL PRIVILEGES");
                on_tables.push("ALL PRIVILEGES");
            }
            p => {
                if let Some(known) = DATABASE_PRIVILEGES.iter().find(|k| **k == p) {
                    on_database.push(*known);
                } else if let Some(known) = TABLE_PRIVILEGES.iter().find(|k| **k == p) {
                    on_tables.push(*known);
                } else {
                    return Err(SqlError::InvalidPrivilege(privilege.clone()));
                }
            }
        }
    }
    for list in [&mut on_database, &mut on_tables] {
        if list.contains(&"ALL PRIVILEGES") {
            *list = vec!["ALL PRIVILEGES"];
        }
        list.dedup();
    }

    let server = (!on_database.is_empty()).then(|| {
        format!(
            "GRANT {} ON DATABASE {db} TO {role};",
            on_database.join(", ")
        )
    });
    let database = (!on_tables.is_empty()).then(|| {
        let list = on_tables.join(", ");
        format!(
            "GRANT {list} ON ALL TABLES IN SCHEMA public TO {role};\n\
             ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT {list} ON TABLES TO {role};"
        )
    });
    Ok(GrantStatements { server, database })
}

/// Database administration on top of a [`SqlExecutor`]
#[derive(Clone)]
pub struct DatabaseAdmin {
    sql: Arc<dyn SqlExecutor>,
    maintenance_db: String,
}

impl DatabaseAdmin {
    /// Administer the server reachable through `sql`
    pub fn new(sql: Arc<dyn SqlExecutor>, maintenance_db: impl Into<String>) -> Self {
        Self {
            sql,
            maintenance_db: maintenance_db.into(),
        }
    }

    /// Create a database unless it already exists
    pub async fn create_database(&self, request: &CreateDatabaseRequest) -> Result<(), SqlError> {
        let name = quote_ident(&request.name)?;
        let exists = format!(
            "SELECT 1 FROM pg_database WHERE datname = {};",
            quote_literal(&request.name)?
        );
        if self.sql.exists(&self.maintenance_db, &exists).await? {
            debug!(database = %request.name, "database already exists");
            return Ok(());
        }
        self.sql
            .execute(&self.maintenance_db, &format!("CREATE DATABASE {name};"))
            .await?;
        info!(database = %request.name, "database created");
        Ok(())
    }

    /// Create a login role, or reset its password if it exists
    pub async fn create_user(&self, request: &CreateUserRequest) -> Result<(), SqlError> {
        let role = quote_ident(&request.username)?;
        let name = quote_literal(&request.username)?;
        let password = quote_literal(&request.password)?;
        let statement = format!(
            "DO {DOLLAR_TAG} BEGIN \
             IF EXISTS (SELECT FROM pg_roles WHERE rolname = {name}) THEN \
             ALTER ROLE {role} WITH LOGIN PASSWORD {password}; \
             ELSE CREATE ROLE {role} WITH LOGIN PASSWORD {password}; \
             END IF; END {DOLLAR_TAG};"
        );
        self.sql.execute(&self.maintenance_db, &statement).await?;
        info!(username = %request.username, "role created");
        Ok(())
    }

    /// Grant privileges on a database to a role
    pub async fn create_grant(&self, request: &CreateGrantRequest) -> Result<(), SqlError> {
        let statements =
            grant_statements(&request.database, &request.username, &request.privileges)?;
        if let Some(sql) = &statements.server {
            self.sql.execute(&self.maintenance_db, sql).await?;
        }
        if let Some(sql) = &statements.database {
            self.sql.execute(&request.database, sql).await?;
        }
        info!(
            database = %request.database,
            username = %request.username,
            privileges = ?request.privileges,
            "privileges granted"
        );
        Ok(())
    }

    /// Whether the server holds any database besides the built-in ones
    pub async fn has_user_databases(&self) -> Result<bool, SqlError> {
        self.sql
            .exists(
                &self.maintenance_db,
                "SELECT 1 FROM pg_database \
                 WHERE datname NOT IN ('postgres', 'template0', 'template1');",
            )
            .await
    }

    /// Whether the server accepts queries
    pub async fn ping(&self) -> Result<(), SqlError> {
        self.sql.execute(&self.maintenance_db, "SELECT 1;").await
    }

    /// Run a SQL script against the maintenance database
    pub async fn run_script(&self, path: &Path) -> Result<(), SqlError> {
        self.sql.execute_file(&self.maintenance_db, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn privileges(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(quote_ident("orders").expect("valid"), "\"orders\"");
        assert_eq!(quote_ident("app-user_1").expect("valid"), "\"app-user_1\"");
        let long = "a".repeat(64);
        for bad in ["", "1db", "a\"b", "x; DROP DATABASE y", long.as_str()] {
            assert!(quote_ident(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn literals_escape_single_quotes() {
        assert_eq!(quote_literal("it's").expect("valid"), "'it''s'");
        assert!(quote_literal("a$strata$b").is_err());
    }

    #[test]
    fn grants_split_database_and_table_privileges() {
        let statements =
            grant_statements("orders", "app", &privileges(&["select", "CONNECT", "insert"]))
                .expect("statements");
        assert_eq!(
            statements.server.as_deref(),
            Some("GRANT CONNECT ON DATABASE \"orders\" TO \"app\";")
        );
        let database = statements.database.expect("table grants");
        assert!(database.starts_with(
            "GRANT SELECT, INSERT ON ALL TABLES IN SCHEMA public TO \"app\";"
        ));
        assert!(database.contains("ALTER DEFAULT PRIVILEGES"));
    }

    #[test]
    fn all_privileges_cover_both_levels() {
        let statements =
            grant_statements("orders", "app", &privileges(&["ALL"])).expect("statements");
        assert!(statements
            .server
            .expect("server")
            .contains("ALL PRIVILEGES ON DATABASE"));
        assert!(statements
            .database
            .expect("database")
            .contains("ALL PRIVILEGES ON ALL TABLES"));
    }

    #[test]
    fn unknown_or_missing_privileges_are_rejected() {
        assert!(matches!(
            grant_statements("orders", "app", &privileges(&["SUPERUSER"])),
            Err(SqlError::InvalidPrivilege(p)) if p == "SUPERUSER"
        ));
        assert!(grant_statements("orders", "app", &[]).is_err());
    }

    #[tokio::test]
    async fn existing_database_is_not_recreated() {
        let mut sql = MockSqlExecutor::new();
        sql.expect_exists()
            .withf(|db, query| db == "postgres" && query.contains("datname = 'orders'"))
            .times(1)
            .returning(|_, _| Ok(true));
        sql.expect_execute().never();

        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");
        admin
            .create_database(&CreateDatabaseRequest {
                name: "orders".to_string(),
            })
            .await
            .expect("create");
    }

    #[tokio::test]
    async fn missing_database_is_created() {
        let mut sql = MockSqlExecutor::new();
        sql.expect_exists().returning(|_, _| Ok(false));
        sql.expect_execute()
            .with(eq("postgres"), eq("CREATE DATABASE \"orders\";"))
            .times(1)
            .returning(|_, _| Ok(()));

        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");
        admin
            .create_database(&CreateDatabaseRequest {
                name: "orders".to_string(),
            })
            .await
            .expect("create");
    }

    #[tokio::test]
    async fn user_creation_is_an_upsert() {
        let mut sql = MockSqlExecutor::new();
        sql.expect_execute()
            .withf(|db, stmt| {
                db == "postgres"
                    && stmt.contains("ALTER ROLE \"app\" WITH LOGIN PASSWORD 'p''w'")
                    && stmt.contains("CREATE ROLE \"app\" WITH LOGIN PASSWORD 'p''w'")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");
        admin
            .create_user(&CreateUserRequest {
                username: "app".to_string(),
                password: "p'w".to_string(),
            })
            .await
            .expect("create");
    }

    #[tokio::test]
    async fn table_grants_run_inside_the_target_database() {
        let mut sql = MockSqlExecutor::new();
        sql.expect_execute()
            .withf(|db, stmt| db == "orders" && stmt.contains("ON ALL TABLES"))
            .times(1)
            .returning(|_, _| Ok(()));

        let admin = DatabaseAdmin::new(Arc::new(sql), "postgres");
        admin
            .create_grant(&CreateGrantRequest {
                database: "orders".to_string(),
                username: "app".to_string(),
                privileges: privileges(&["SELECT"]),
            })
            .await
            .expect("grant");
    }
}
