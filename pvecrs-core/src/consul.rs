//! Coordination service integration.
//!
//! Consul serves two purposes: bootstrap (API endpoints and the auth
//! token live in its KV store) and leader election (a TTL session plus a
//! KV acquire makes sure only one scheduler instance runs ticks). The
//! [`Coordinator`] trait keeps the engine independent of the concrete
//! service so deployments can swap it out.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{CrsError, CrsResult};

/// KV key holding a JSON array of Proxmox API base URLs.
const PVE_NODES_KEY: &str = "crs/config/proxmox/nodes";
/// KV key holding `{"user": ..., "token": ...}` credentials.
const PVE_AUTH_KEY: &str = "crs/config/proxmox/auth";

/// A held cluster-wide lock, kept alive by a background session-renewal
/// task. Dropping the handle stops renewal; the TTL then expires the
/// session and with it the lock.
#[derive(Debug)]
pub struct LockHandle {
    pub key: String,
    pub session_id: String,
    lost_rx: Option<watch::Receiver<bool>>,
    renew_task: Option<tokio::task::JoinHandle<()>>,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            session_id: session_id.into(),
            lost_rx: None,
            renew_task: None,
        }
    }

    /// Completes when the coordinator observes the session as gone.
    /// Pends forever for handles without session monitoring.
    pub async fn lost(&self) {
        let mut rx = match &self.lost_rx {
            Some(rx) => rx.clone(),
            None => return std::future::pending().await,
        };
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Renewal task ended without declaring the lock lost.
                return std::future::pending().await;
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Proxmox API base URLs from the service catalog.
    async fn pve_endpoints(&self) -> CrsResult<Vec<String>>;
    /// API token in `user!tokenid=secret` form.
    async fn pve_auth_token(&self) -> CrsResult<String>;
    /// Tries to take the cluster-wide lock. `None` means another
    /// instance holds it.
    async fn acquire_lock(&self, key: &str) -> CrsResult<Option<LockHandle>>;
    async fn release_lock(&self, handle: LockHandle) -> CrsResult<()>;
}

/// [`Coordinator`] backed by the Consul HTTP API.
pub struct ConsulCoordinator {
    base_url: String,
    http: reqwest::Client,
    session_ttl: Duration,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct PveAuth {
    user: String,
    token: String,
}

impl ConsulCoordinator {
    pub fn new(addr: &str) -> CrsResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CrsError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: addr.trim_end_matches('/').to_string(),
            http,
            session_ttl: Duration::from_secs(30),
        })
    }

    async fn kv_raw(&self, key: &str) -> CrsResult<Vec<u8>> {
        let url = format!("{}/v1/kv/{key}?raw", self.base_url);
        debug!("GET {url}");
        let response = self.http.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CrsError::Coordination {
                message: format!("key {key} not found"),
            });
        }
        if !response.status().is_success() {
            return Err(CrsError::Coordination {
                message: format!("reading key {key} failed: HTTP {}", response.status()),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn create_session(&self) -> CrsResult<String> {
        let url = format!("{}/v1/session/create", self.base_url);
        let body = serde_json::json!({
            "Name": "pvecrs-scheduler",
            "Behavior": "delete",
            "TTL": format!("{}s", self.session_ttl.as_secs()),
        });
        let response = self.http.put(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(CrsError::Coordination {
                message: format!("session create failed: HTTP {}", response.status()),
            });
        }
        let created: SessionCreated = response.json().await.map_err(CrsError::from)?;
        Ok(created.id)
    }

    async fn destroy_session(&self, session_id: &str) -> CrsResult<()> {
        let url = format!("{}/v1/session/destroy/{session_id}", self.base_url);
        let response = self.http.put(&url).send().await?;
        if !response.status().is_success() {
            return Err(CrsError::Coordination {
                message: format!("session destroy failed: HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    /// Renews the session at half its TTL until it disappears, then
    /// reports the lock as lost.
    fn spawn_renewal(&self, session_id: String) -> (watch::Receiver<bool>, tokio::task::JoinHandle<()>) {
        let (lost_tx, lost_rx) = watch::channel(false);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let period = self.session_ttl / 2;

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let url = format!("{base_url}/v1/session/renew/{session_id}");
                match http.put(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!("renewed session {session_id}");
                    }
                    Ok(response) => {
                        warn!(
                            "session {session_id} renewal failed with HTTP {}, lock is lost",
                            response.status()
                        );
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        // Transient; the session survives until its TTL.
                        warn!("session {session_id} renewal attempt failed: {e}");
                    }
                }
            }
        });

        (lost_rx, task)
    }
}

#[async_trait]
impl Coordinator for ConsulCoordinator {
    async fn pve_endpoints(&self) -> CrsResult<Vec<String>> {
        let raw = self.kv_raw(PVE_NODES_KEY).await?;
        let endpoints: Vec<String> = serde_json::from_slice(&raw)
            .map_err(|e| CrsError::serialization("decode endpoint list", e))?;
        if endpoints.is_empty() {
            return Err(CrsError::Coordination {
                message: "endpoint list is empty".to_string(),
            });
        }
        Ok(endpoints)
    }

    async fn pve_auth_token(&self) -> CrsResult<String> {
        let raw = self.kv_raw(PVE_AUTH_KEY).await?;
        let auth: PveAuth = serde_json::from_slice(&raw)
            .map_err(|e| CrsError::serialization("decode auth credentials", e))?;
        Ok(format!("{}!{}", auth.user, auth.token))
    }

    async fn acquire_lock(&self, key: &str) -> CrsResult<Option<LockHandle>> {
        let session_id = self.create_session().await?;
        let url = format!("{}/v1/kv/{key}?acquire={session_id}", self.base_url);
        let response = self
            .http
            .put(&url)
            .body(session_id.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CrsError::Coordination {
                message: format!("lock acquire failed: HTTP {}", response.status()),
            });
        }
        let acquired: bool = response.json().await.map_err(CrsError::from)?;
        if acquired {
            debug!("acquired lock {key} with session {session_id}");
            let (lost_rx, renew_task) = self.spawn_renewal(session_id.clone());
            let mut handle = LockHandle::new(key, session_id);
            handle.lost_rx = Some(lost_rx);
            handle.renew_task = Some(renew_task);
            Ok(Some(handle))
        } else {
            self.destroy_session(&session_id).await?;
            info!("lock {key} is held by another instance");
            Ok(None)
        }
    }

    async fn release_lock(&self, handle: LockHandle) -> CrsResult<()> {
        let url = format!(
            "{}/v1/kv/{}?release={}",
            self.base_url, handle.key, handle.session_id
        );
        let response = self.http.put(&url).send().await?;
        if !response.status().is_success() {
            return Err(CrsError::Coordination {
                message: format!("lock release failed: HTTP {}", response.status()),
            });
        }
        self.destroy_session(&handle.session_id).await?;
        debug!("released lock {}", handle.key);
        Ok(())
    }
}
