//! Secret-store runners
//!
//! Two ways to talk to an OpenBao/Vault server: through its CLI inside the
//! running container, or over its HTTP API. Both return the server's JSON
//! documents; the unseal state machine lives in the services layer.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use super::engine::Engine;
use crate::error::UnsealError;

/// Number of unseal shares requested on init
pub const INIT_SHARES: u32 = 5;

/// Shares required to unseal
pub const INIT_THRESHOLD: u32 = 3;

/// Exit code the CLI uses for "sealed" on `status`
const SEALED_EXIT_CODE: i32 = 2;

/// Seal status document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    #[serde(rename = "type", default)]
    pub seal_type: String,
    pub initialized: bool,
    pub sealed: bool,
    #[serde(rename = "t", default)]
    pub threshold: u32,
    #[serde(rename = "n", default)]
    pub shares: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub version: String,
}

/// Init response as persisted in the rendered topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitData {
    #[serde(default)]
    pub unseal_keys_b64: Vec<String>,
    #[serde(default)]
    pub unseal_keys_hex: Vec<String>,
    #[serde(default)]
    pub unseal_shares: u32,
    #[serde(default)]
    pub unseal_threshold: u32,
    #[serde(default)]
    pub root_token: String,
}

impl InitData {
    pub fn parse(raw: &str) -> Result<Self, UnsealError> {
        serde_json::from_str(raw).map_err(|e| UnsealError::Malformed {
            message: format!("init data: {e}"),
        })
    }
}

fn parse_status(raw: &str) -> Result<SealStatus, UnsealError> {
    serde_json::from_str(raw).map_err(|e| UnsealError::Malformed {
        message: format!("seal status: {e}"),
    })
}

/// Operations needed to bring a secret store out of its sealed state
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn status(&self) -> Result<SealStatus, UnsealError>;

    /// Initialize the store, returning the raw init JSON
    async fn init(&self) -> Result<String, UnsealError>;

    /// Submit one unseal share
    async fn unseal(&self, share: &str) -> Result<SealStatus, UnsealError>;
}

/// Runs the store's CLI inside its container
pub struct ExecSecretStore<'a> {
    engine: &'a dyn Engine,
    container: String,
    binary: OnceCell<String>,
}

impl<'a> ExecSecretStore<'a> {
    pub fn new(engine: &'a dyn Engine, container: impl Into<String>) -> Self {
        Self {
            engine,
            container: container.into(),
            binary: OnceCell::new(),
        }
    }

    async fn binary(&self) -> Result<&str, UnsealError> {
        let bin = self
            .binary
            .get_or_try_init(|| async {
                for candidate in ["bao", "vault"] {
                    let probe = vec!["which".to_string(), candidate.to_string()];
                    let out = self
                        .engine
                        .exec(&self.container, &probe)
                        .await
                        .map_err(|e| UnsealError::Api {
                            message: e.to_string(),
                        })?;
                    if out.success() && !out.stdout.trim().is_empty() {
                        return Ok(out.stdout.trim().to_string());
                    }
                }
                Err(UnsealError::Api {
                    message: format!("bao/vault executable not found in container {}", self.container),
                })
            })
            .await?;
        Ok(bin.as_str())
    }

    async fn run(&self, args: &[&str], ok_codes: &[i32]) -> Result<String, UnsealError> {
        let mut command = vec![self.binary().await?.to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        debug!("Running {} {} in {}", command[0], args[0], self.container);

        let out = self
            .engine
            .exec(&self.container, &command)
            .await
            .map_err(|e| UnsealError::Api {
                message: e.to_string(),
            })?;

        if !ok_codes.contains(&out.exit_code) {
            return Err(UnsealError::Api {
                message: format!(
                    "`{} {}` exited with {}: {}",
                    command[0],
                    args[0],
                    out.exit_code,
                    out.stderr.trim()
                ),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl SecretStore for ExecSecretStore<'_> {
    async fn status(&self) -> Result<SealStatus, UnsealError> {
        let stdout = self
            .run(&["status", "-format=json"], &[0, SEALED_EXIT_CODE])
            .await?;
        parse_status(&stdout)
    }

    async fn init(&self) -> Result<String, UnsealError> {
        let shares = format!("-key-shares={INIT_SHARES}");
        let threshold = format!("-key-threshold={INIT_THRESHOLD}");
        let stdout = self
            .run(
                &["operator", "init", "-format=json", &shares, &threshold],
                &[0],
            )
            .await?;
        // validate before handing it out for persistence
        InitData::parse(&stdout)?;
        Ok(stdout.trim().to_string())
    }

    async fn unseal(&self, share: &str) -> Result<SealStatus, UnsealError> {
        let stdout = self
            .run(&["operator", "unseal", "-format=json", share], &[0, SEALED_EXIT_CODE])
            .await?;
        parse_status(&stdout)
    }
}

/// Talks to the store's HTTP API
pub struct HttpSecretStore {
    client: Client,
    addr: Url,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    keys_base64: Vec<String>,
    #[serde(default)]
    root_token: String,
}

impl HttpSecretStore {
    pub fn new(addr: &str) -> Result<Self, UnsealError> {
        let addr = Url::parse(addr).map_err(|e| UnsealError::Api {
            message: format!("invalid address {addr}: {e}"),
        })?;
        Ok(Self {
            client: Client::new(),
            addr,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, UnsealError> {
        self.addr.join(path).map_err(|e| UnsealError::Api {
            message: e.to_string(),
        })
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, UnsealError> {
        let api = |e: reqwest::Error| UnsealError::Api {
            message: e.to_string(),
        };
        let response = request.send().await.map_err(api)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UnsealError::Api {
                message: format!("HTTP {status}: {}", body.trim()),
            });
        }
        response.json().await.map_err(|e| UnsealError::Malformed {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn status(&self) -> Result<SealStatus, UnsealError> {
        let url = self.endpoint("/v1/sys/seal-status")?;
        self.send(self.client.get(url)).await
    }

    async fn init(&self) -> Result<String, UnsealError> {
        let url = self.endpoint("/v1/sys/init")?;
        let body = json!({
            "secret_shares": INIT_SHARES,
            "secret_threshold": INIT_THRESHOLD,
        });
        let resp: InitResponse = self.send(self.client.put(url).json(&body)).await?;

        let data = InitData {
            unseal_keys_b64: resp.keys_base64,
            unseal_keys_hex: resp.keys,
            unseal_shares: INIT_SHARES,
            unseal_threshold: INIT_THRESHOLD,
            root_token: resp.root_token,
        };
        serde_json::to_string(&data).map_err(|e| UnsealError::Malformed {
            message: e.to_string(),
        })
    }

    async fn unseal(&self, share: &str) -> Result<SealStatus, UnsealError> {
        let url = self.endpoint("/v1/sys/unseal")?;
        self.send(self.client.put(url).json(&json!({ "key": share })))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::engine::mock::{Call, RecordingEngine};
    use crate::infrastructure::engine::ExecOutput;

    const SEALED: &str = r#"{"type":"shamir","initialized":true,"sealed":true,"t":3,"n":5,"progress":0,"version":"2.2.0"}"#;

    #[tokio::test]
    async fn test_exec_status_tolerates_sealed_exit_code() {
        let engine = RecordingEngine::new().on_exec(|_, cmd| match cmd[0].as_str() {
            "which" if cmd[1] == "bao" => ExecOutput::ok("/bin/bao\n"),
            "/bin/bao" => ExecOutput {
                exit_code: 2,
                stdout: SEALED.to_string(),
                stderr: String::new(),
            },
            _ => ExecOutput::failed(1, ""),
        });
        let store = ExecSecretStore::new(&engine, "prod-vault");

        let status = store.status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.threshold, 3);

        // binary lookup is cached
        store.status().await.unwrap();
        let probes = engine
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Exec(_, cmd) if cmd[0] == "which"))
            .count();
        assert_eq!(probes, 1);
    }

    #[tokio::test]
    async fn test_exec_falls_back_to_vault_binary() {
        let engine = RecordingEngine::new().on_exec(|_, cmd| match cmd[0].as_str() {
            "which" if cmd[1] == "vault" => ExecOutput::ok("/usr/bin/vault"),
            "/usr/bin/vault" => ExecOutput::ok(SEALED),
            _ => ExecOutput::failed(1, ""),
        });
        let store = ExecSecretStore::new(&engine, "prod-vault");
        assert!(store.status().await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_missing_binary() {
        let engine = RecordingEngine::new().on_exec(|_, _| ExecOutput::failed(1, ""));
        let store = ExecSecretStore::new(&engine, "prod-vault");
        let err = store.status().await.unwrap_err();
        assert!(err.to_string().contains("not found in container prod-vault"));
    }

    #[tokio::test]
    async fn test_exec_init_requests_shares() {
        let engine = RecordingEngine::new().on_exec(|_, cmd| match cmd[0].as_str() {
            "which" => ExecOutput::ok("bao"),
            _ => ExecOutput::ok(r#"{"unseal_keys_b64":["a","b","c"],"unseal_shares":5,"unseal_threshold":3,"root_token":"t"}"#),
        });
        let store = ExecSecretStore::new(&engine, "prod-vault");
        let raw = store.init().await.unwrap();
        assert_eq!(InitData::parse(&raw).unwrap().unseal_keys_b64.len(), 3);

        let (_, cmd) = engine.execs().pop().unwrap();
        assert!(cmd.contains(&"-key-shares=5".to_string()));
        assert!(cmd.contains(&"-key-threshold=3".to_string()));
    }

    #[test]
    fn test_init_data_rejects_garbage() {
        assert!(matches!(
            InitData::parse("nope"),
            Err(UnsealError::Malformed { .. })
        ));
    }

    #[test]
    fn test_http_store_rejects_bad_address() {
        assert!(HttpSecretStore::new("not a url").is_err());
        assert!(HttpSecretStore::new("http://127.0.0.1:8200").is_ok());
    }
}
