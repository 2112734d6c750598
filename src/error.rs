//! Centralized error types for the installer
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::domain::bootstrap::Phase;

/// Top-level error type for installer operations
#[derive(Error, Debug)]
pub enum InstallerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Unseal error: {0}")]
    Unseal(#[from] UnsealError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

impl InstallerError {
    /// True for polling budget exhaustion, so callers can point at a container
    /// that never came up instead of a failing engine call.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Workflow(w) => w.errors.iter().any(InstallerError::is_timeout),
            _ => false,
        }
    }

    /// Attach phase and service context to a bare engine failure
    pub fn in_phase(self, phase: Phase, service: &str) -> Self {
        match self {
            Self::Engine(source) => PhaseError::new(phase, source).with_service(service).into(),
            other => other,
        }
    }
}

/// Configuration errors: fatal, surfaced immediately, never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{helper}: service \"{service}\" not found")]
    ServiceNotFound {
        helper: &'static str,
        service: String,
    },

    #[error("service \"{service}\" depends on undefined service \"{dependency}\"")]
    UnresolvedDependency { service: String, dependency: String },

    #[error("dependency cycle detected between services: {services}")]
    DependencyCycle { services: String },

    #[error("invalid volume \"{spec}\": expected <source>:<target>[:<mode>]")]
    InvalidVolume { spec: String },

    #[error("invalid {field} \"{value}\": {reason}")]
    InvalidName {
        field: String,
        value: String,
        reason: String,
    },

    #[error("service \"{service}\" is declared by more than one manifest")]
    DuplicateService { service: String },

    #[error("namespace mismatch: project is \"{expected}\", manifest declares \"{actual}\"")]
    NamespaceMismatch { expected: String, actual: String },

    #[error("unknown kind {kind} in apiVersion {api_version}")]
    UnknownKind { api_version: String, kind: String },

    #[error("Required configuration missing: {field}")]
    MissingField { field: String },

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    #[error("Failed to parse config: {message}")]
    Parse { message: String },

    #[error("Failed to access {path}: {message}")]
    Io { path: String, message: String },
}

/// Secrets subsystem errors: never downgraded to plaintext
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("recipient mismatch: secrets are sealed for {expected}, provided identity is {actual}")]
    RecipientMismatch { expected: String, actual: String },

    #[error("decryption failed: authentication tag mismatch")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("malformed secret token: {reason}")]
    MalformedToken { reason: String },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("invalid armored payload: {reason}")]
    Armor { reason: String },

    #[error("an identity is required to decrypt project secrets")]
    MissingIdentity,
}

/// Failures returned by the container engine collaborator
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {message}")]
    InvalidOutput { command: String, message: String },

    #[error("failed to render topology: {message}")]
    Render { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An engine failure with the bootstrap phase and service it happened in
#[derive(Error, Debug)]
pub struct PhaseError {
    pub phase: Phase,
    pub service: Option<String>,
    #[source]
    pub source: EngineError,
}

impl PhaseError {
    pub fn new(phase: Phase, source: EngineError) -> Self {
        Self {
            phase,
            service: None,
            source,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service {
            Some(service) => write!(
                f,
                "phase={} service={}: {}",
                self.phase, service, self.source
            ),
            None => write!(f, "phase={}: {}", self.phase, self.source),
        }
    }
}

/// A bounded polling loop ran out of attempts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    pub operation: String,
    pub attempts: u32,
    pub interval: Duration,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timed out waiting for {} after {} attempts ({} apart); is the container actually starting?",
            self.operation,
            self.attempts,
            humantime::format_duration(self.interval)
        )
    }
}

/// Secret-store unseal workflow errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsealError {
    #[error("unseal data for {service} already exists; refusing to re-initialize without --force")]
    SharesExist { service: String },

    #[error("{service} is initialized but no unseal shares are persisted")]
    SharesMissing { service: String },

    #[error("{service} unseal failed: still sealed after {submitted} shares")]
    Exhausted { service: String, submitted: usize },

    #[error("secret store request failed: {message}")]
    Api { message: String },

    #[error("malformed secret store response: {message}")]
    Malformed { message: String },
}

/// Errors collected from concurrently running workflow tasks
#[derive(Error, Debug)]
pub struct WorkflowError {
    pub errors: Vec<InstallerError>,
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        f.write_str(&joined)
    }
}

impl WorkflowError {
    /// Fold task results into one outcome: no error, the single error
    /// unchanged, or every error combined.
    pub fn combine<I>(results: I) -> Result<(), InstallerError>
    where
        I: IntoIterator<Item = Result<(), InstallerError>>,
    {
        let mut errors: Vec<InstallerError> =
            results.into_iter().filter_map(Result::err).collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(WorkflowError { errors }.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_not_found_display() {
        let err = ConfigError::ServiceNotFound {
            helper: "CapAdd",
            service: "adcm".to_string(),
        };
        assert_eq!(err.to_string(), "CapAdd: service \"adcm\" not found");
    }

    #[test]
    fn test_phase_error_display() {
        let err = PhaseError::new(
            Phase::Init,
            EngineError::InvalidOutput {
                command: "docker compose up".to_string(),
                message: "boom".to_string(),
            },
        )
        .with_service("init-postgres");
        assert!(err
            .to_string()
            .starts_with("phase=init service=init-postgres: "));
    }

    #[test]
    fn test_timeout_display() {
        let err = TimeoutError {
            operation: "vault to be running".to_string(),
            attempts: 15,
            interval: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("15 attempts"));
        assert!(msg.contains("2s"));
    }

    #[test]
    fn test_error_conversion() {
        let crypto_err = CryptoError::Decrypt;
        let err: InstallerError = crypto_err.into();
        assert!(matches!(err, InstallerError::Crypto(_)));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_combine_keeps_both_errors() {
        let first: Result<(), InstallerError> = Err(UnsealError::SharesMissing {
            service: "vault".to_string(),
        }
        .into());
        let second: Result<(), InstallerError> = Err(ConfigError::MissingField {
            field: "db-name".to_string(),
        }
        .into());

        let err = WorkflowError::combine([first, second]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no unseal shares"));
        assert!(msg.contains("db-name"));
        assert!(matches!(err, InstallerError::Workflow(ref w) if w.errors.len() == 2));
    }

    #[test]
    fn test_combine_single_error_is_unwrapped() {
        let timeout = TimeoutError {
            operation: "vault".to_string(),
            attempts: 3,
            interval: Duration::from_secs(1),
        };
        let err = WorkflowError::combine([Ok(()), Err(timeout.into())]).unwrap_err();
        assert!(matches!(err, InstallerError::Timeout(_)));
        assert!(err.is_timeout());
        assert!(WorkflowError::combine([Ok(()), Ok(())]).is_ok());
    }
}
