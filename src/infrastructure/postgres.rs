//! Database provisioning through `psql` inside the database container
//!
//! Every operation is check-then-create so reruns are no-ops. Identifiers
//! are validated and quoted, literals are escaped, before any SQL is built.

use tracing::info;

use super::engine::Engine;
use crate::error::{ConfigError, EngineError, InstallerError};

/// Maximum length for PostgreSQL identifiers (standard limit)
pub const PG_IDENTIFIER_MAX_LENGTH: usize = 63;

/// Superuser the admin session connects as
pub const PG_SUPERUSER: &str = "postgres";

/// Characters allowed in identifiers besides alphanumerics
const IDENTIFIER_ALLOWED_CHARS: &[char] = &['_', '$'];

/// Whether an ensure call had to create the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Created,
    Existed,
}

/// Validate a PostgreSQL identifier
///
/// Must be non-empty, at most 63 characters, start with a letter or
/// underscore and contain only alphanumerics, `_` or `$`.
pub fn validate_pg_identifier(name: &str, field: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidName {
        field: field.to_string(),
        value: name.to_string(),
        reason,
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("cannot be empty".to_string()));
    };
    if name.len() > PG_IDENTIFIER_MAX_LENGTH {
        return Err(invalid(format!(
            "exceeds PostgreSQL maximum identifier length ({} > {})",
            name.len(),
            PG_IDENTIFIER_MAX_LENGTH
        )));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(invalid(format!(
            "must start with a letter or underscore, got '{first}'"
        )));
    }

    let bad: Vec<char> = name
        .chars()
        .filter(|c| !c.is_ascii_alphanumeric() && !IDENTIFIER_ALLOWED_CHARS.contains(c))
        .collect();
    if !bad.is_empty() {
        return Err(invalid(format!(
            "contains invalid characters: {bad:?} (allowed: a-z, A-Z, 0-9, _, $)"
        )));
    }
    Ok(())
}

pub fn validate_password(password: &str, field: &str) -> Result<(), ConfigError> {
    if password.is_empty() {
        return Err(ConfigError::MissingField {
            field: field.to_string(),
        });
    }
    if password != password.trim() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: "<password with leading or trailing whitespace>".to_string(),
        });
    }
    Ok(())
}

/// `"name"` with embedded quotes doubled
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `'value'` with embedded quotes doubled
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Admin session against a running database container
pub struct PgAdmin<'a> {
    engine: &'a dyn Engine,
    container: String,
}

impl<'a> PgAdmin<'a> {
    pub fn new(engine: &'a dyn Engine, container: impl Into<String>) -> Self {
        Self {
            engine,
            container: container.into(),
        }
    }

    /// Run one statement, returning unaligned tuples-only output
    async fn query(&self, sql: &str) -> Result<String, EngineError> {
        let command: Vec<String> = [
            "psql",
            "-v",
            "ON_ERROR_STOP=1",
            "-U",
            PG_SUPERUSER,
            "-d",
            "postgres",
            "-tAc",
            sql,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let out = self.engine.exec(&self.container, &command).await?;
        if !out.success() {
            return Err(EngineError::CommandFailed {
                command: format!("psql in {}", self.container),
                status: format!("exit code {}", out.exit_code),
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    async fn exists(&self, sql: &str) -> Result<bool, EngineError> {
        Ok(self.query(sql).await?.trim() == "1")
    }

    /// Create a login role unless one with this name exists
    pub async fn ensure_role(&self, name: &str, password: &str) -> Result<Ensured, InstallerError> {
        validate_pg_identifier(name, "db-user")?;
        validate_password(password, "db-pass")?;

        let check = format!("SELECT 1 FROM pg_roles WHERE rolname = {}", quote_literal(name));
        if self.exists(&check).await? {
            info!("✓ Role '{}' already exists", name);
            return Ok(Ensured::Existed);
        }

        let create = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            quote_identifier(name),
            quote_literal(password)
        );
        self.query(&create).await?;
        info!("✓ Role '{}' created", name);
        Ok(Ensured::Created)
    }

    /// Create a database owned by `owner` unless it exists
    pub async fn ensure_database(&self, name: &str, owner: &str) -> Result<Ensured, InstallerError> {
        validate_pg_identifier(name, "db-name")?;
        validate_pg_identifier(owner, "db-user")?;

        let check = format!(
            "SELECT 1 FROM pg_database WHERE datname = {}",
            quote_literal(name)
        );
        if self.exists(&check).await? {
            info!("✓ Database '{}' already exists", name);
            return Ok(Ensured::Existed);
        }

        let create = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_identifier(name),
            quote_identifier(owner)
        );
        self.query(&create).await?;
        info!("✓ Database '{}' created", name);
        Ok(Ensured::Created)
    }
}
