//! Secret-store unseal workflow
//!
//! State machine:
//!
//! ```text
//! Unknown -> PollingForContainer -> SealStatusKnown
//!   -> Unsealed                                  (already unsealed, no-op)
//!   -> Initializing | ReusingPersistedShares -> Unsealing -> Unsealed
//! ```
//!
//! Fresh init data is encrypted and persisted before any share is submitted,
//! so a crash mid-unseal never loses the recovery shares.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use super::retry::{poll, RetryPolicy};
use crate::domain::bootstrap::Phase;
use crate::error::{InstallerError, UnsealError};
use crate::infrastructure::engine::Engine;
use crate::infrastructure::secret_store::{InitData, SecretStore};
use crate::secrets::ValueCipher;

/// States of the unseal workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsealState {
    Unknown,
    PollingForContainer,
    SealStatusKnown,
    Initializing,
    ReusingPersistedShares,
    Unsealing,
    Unsealed,
}

/// Where the (possibly encrypted) init data is kept between runs
pub trait SharePersistence: Send + Sync {
    fn load(&self) -> Result<Option<String>, InstallerError>;

    fn save(&self, data: &str) -> Result<(), InstallerError>;
}

/// In-memory persistence, used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryShares {
    data: Mutex<Option<String>>,
}

impl MemoryShares {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            data: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SharePersistence for MemoryShares {
    fn load(&self) -> Result<Option<String>, InstallerError> {
        Ok(self.get())
    }

    fn save(&self, data: &str) -> Result<(), InstallerError> {
        let mut slot = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(data.to_string());
        Ok(())
    }
}

/// What a completed run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealReport {
    pub transitions: Vec<UnsealState>,
    pub initialized: bool,
    pub shares_submitted: usize,
}

impl UnsealReport {
    pub fn final_state(&self) -> UnsealState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(UnsealState::Unknown)
    }
}

/// One unseal run against one secret-store service
pub struct UnsealWorkflow<'a> {
    engine: &'a dyn Engine,
    store: &'a dyn SecretStore,
    shares: &'a dyn SharePersistence,
    cipher: Option<&'a ValueCipher>,
    project: String,
    service: String,
    force: bool,
    policy: RetryPolicy,
}

impl<'a> UnsealWorkflow<'a> {
    pub fn new(
        engine: &'a dyn Engine,
        store: &'a dyn SecretStore,
        shares: &'a dyn SharePersistence,
        project: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            shares,
            cipher: None,
            project: project.into(),
            service: service.into(),
            force: false,
            policy: RetryPolicy::CONTAINER,
        }
    }

    /// Encrypt persisted init data with the project master key
    pub fn with_cipher(mut self, cipher: Option<&'a ValueCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Re-initialize even if init data from a previous run exists
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn run(&self) -> Result<UnsealReport, InstallerError> {
        let mut report = UnsealReport {
            transitions: vec![UnsealState::Unknown],
            initialized: false,
            shares_submitted: 0,
        };

        report.transitions.push(UnsealState::PollingForContainer);
        self.wait_for_container().await?;

        let status = self.store.status().await?;
        report.transitions.push(UnsealState::SealStatusKnown);
        debug!(
            "{} seal status: initialized={} sealed={}",
            self.service, status.initialized, status.sealed
        );

        if !status.sealed {
            info!("{} {} already unsealed", Phase::Unseal.emoji(), self.service);
            report.transitions.push(UnsealState::Unsealed);
            return Ok(report);
        }

        let persisted = self.shares.load()?;
        let init_data = if !status.initialized {
            if persisted.is_some() && !self.force {
                return Err(UnsealError::SharesExist {
                    service: self.service.clone(),
                }
                .into());
            }
            report.transitions.push(UnsealState::Initializing);
            report.initialized = true;
            self.initialize().await?
        } else {
            report.transitions.push(UnsealState::ReusingPersistedShares);
            let stored = persisted.ok_or_else(|| UnsealError::SharesMissing {
                service: self.service.clone(),
            })?;
            InitData::parse(&self.decrypt(&stored)?)?
        };

        report.transitions.push(UnsealState::Unsealing);
        for share in &init_data.unseal_keys_b64 {
            let status = self.store.unseal(share).await?;
            report.shares_submitted += 1;
            if !status.sealed {
                info!(
                    "{} {} unsealed after {} share(s)",
                    Phase::Unseal.emoji(),
                    self.service,
                    report.shares_submitted
                );
                report.transitions.push(UnsealState::Unsealed);
                return Ok(report);
            }
        }

        Err(UnsealError::Exhausted {
            service: self.service.clone(),
            submitted: report.shares_submitted,
        }
        .into())
    }

    async fn wait_for_container(&self) -> Result<(), InstallerError> {
        let operation = format!("{} to be running", self.service);
        poll(
            self.policy,
            &operation,
            || async {
                let instances = self.engine.list(false).await?;
                Ok(instances.into_iter().any(|i| {
                    i.project == self.project && i.service == self.service && i.is_running()
                }))
            },
            |running| *running,
        )
        .await
        .map(|_| ())
    }

    /// Request fresh shares and persist them before use
    async fn initialize(&self) -> Result<InitData, InstallerError> {
        info!("{} Initializing {}", Phase::Unseal.emoji(), self.service);
        let raw = self.store.init().await?;
        let data = InitData::parse(&raw)?;

        let stored = match self.cipher {
            Some(cipher) => cipher.encrypt_value(&raw)?,
            None => raw,
        };
        self.shares.save(&stored)?;
        Ok(data)
    }

    fn decrypt(&self, stored: &str) -> Result<String, InstallerError> {
        match self.cipher {
            Some(cipher) => Ok(cipher.decrypt_value(stored)?),
            None => Ok(stored.to_string()),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{status, ScriptedStore, INIT_JSON};
    use super::*;
    use crate::domain::topology::Project;
    use crate::infrastructure::engine::mock::{Call, RecordingEngine};

    async fn running_engine() -> RecordingEngine {
        let engine = RecordingEngine::new();
        let mut project = Project::new("prod");
        project.ensure_service("vault");
        engine.up(&project, &[]).await.unwrap();
        engine
    }

    #[test]
    fn test_memory_shares_survive_poisoned_lock() {
        let shares = std::sync::Arc::new(MemoryShares::new(Some("old".to_string())));
        let held = shares.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.data.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(shares.data.is_poisoned());

        shares.save("new").unwrap();
        assert_eq!(shares.load().unwrap().as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_unsealed_is_noop() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(true, false), 3);
        let shares = MemoryShares::default();

        let report = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .run()
            .await
            .unwrap();

        assert_eq!(report.final_state(), UnsealState::Unsealed);
        assert_eq!(store.init_calls(), 0);
        assert_eq!(store.unseal_calls(), 0);
        assert!(shares.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_running_times_out_after_budget() {
        let engine = RecordingEngine::new().never_running("vault");
        let mut project = Project::new("prod");
        project.ensure_service("vault");
        engine.create(&project).await.unwrap();
        let store = ScriptedStore::new(status(true, true), 3);
        let shares = MemoryShares::default();

        let err = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .run()
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let polls = engine.calls().iter().filter(|c| **c == Call::List).count();
        assert_eq!(polls, RetryPolicy::CONTAINER.max_attempts as usize);
        assert_eq!(store.init_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_init_persists_encrypted_then_unseals() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(false, true), 3);
        let shares = MemoryShares::default();
        let cipher = ValueCipher::generate();

        let report = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .with_cipher(Some(&cipher))
            .run()
            .await
            .unwrap();

        assert!(report.initialized);
        assert_eq!(report.shares_submitted, 3);
        assert!(report.transitions.contains(&UnsealState::Initializing));
        assert_eq!(store.init_calls(), 1);

        let persisted = shares.get().unwrap();
        assert!(!persisted.contains("k1"));
        assert_eq!(cipher.decrypt_value(&persisted).unwrap(), INIT_JSON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_shares_block_reinit_without_force() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(false, true), 3);
        let shares = MemoryShares::new(Some("old".to_string()));

        let err = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InstallerError::Unseal(UnsealError::SharesExist { .. })
        ));
        assert_eq!(store.init_calls(), 0);
        assert_eq!(shares.get().as_deref(), Some("old"));

        let report = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .with_force(true)
            .run()
            .await
            .unwrap();
        assert!(report.initialized);
        assert_eq!(shares.get().as_deref(), Some(INIT_JSON));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sealed_reuses_persisted_shares() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(true, true), 2);
        let cipher = ValueCipher::generate();
        let shares = MemoryShares::new(Some(cipher.encrypt_value(INIT_JSON).unwrap()));

        let report = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .with_cipher(Some(&cipher))
            .run()
            .await
            .unwrap();

        assert!(!report.initialized);
        assert!(report
            .transitions
            .contains(&UnsealState::ReusingPersistedShares));
        assert_eq!(store.init_calls(), 0);
        let submitted: Vec<String> = store.submitted.lock().unwrap().iter().cloned().collect();
        assert_eq!(submitted, vec!["k1", "k2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sealed_without_shares_fails() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(true, true), 3);
        let shares = MemoryShares::default();

        let err = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallerError::Unseal(UnsealError::SharesMissing { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_shares_fail() {
        let engine = running_engine().await;
        let store = ScriptedStore::new(status(true, true), 10);
        let shares = MemoryShares::new(Some(INIT_JSON.to_string()));

        let err = UnsealWorkflow::new(&engine, &store, &shares, "prod", "vault")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallerError::Unseal(UnsealError::Exhausted { submitted: 5, .. })
        ));
    }
}
