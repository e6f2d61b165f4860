//! Client proxy: reproduces the [`StoreController`] surface over the wire.
//!
//! Every request opens its own connection (connect, one request frame, one
//! reply frame, close), so a phase fetch parked in a server-side long-poll
//! never blocks unrelated traffic. Outbound requests are bounded by the
//! client's own [`RequestLimiter`] and transient connection failures are
//! retried by [`retry_transient`], with each attempt re-acquiring a fresh
//! limiter slot.

use super::protocol::{read_frame, write_frame, Reply, ReplyError, Request, RequestPackageReply};
use crate::config::{ConnectOptions, ProtocolConfig};
use crate::limit::RequestLimiter;
use crate::retry::{retry_transient, RetryConfig};
use crate::store::{
    CorrelationId, PackageFilesResponse, PackageResponse, Phase, PhaseSender, StoreController,
    UpdateConnectionsOptions, UploadOptions, WantedDependency,
};
use crate::{DepotError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tracing::debug;

/// Client-side store controller speaking the wire protocol.
///
/// Cheap to clone; clones share the limiter and the deduplication state.
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    addr: SocketAddr,
    limiter: RequestLimiter,
    retry: RetryConfig,
    closed: AtomicBool,
    /// Present only when deduplication is enabled: key → the shared
    /// in-flight response.
    inflight: Option<Mutex<HashMap<String, Phase<PackageResponse>>>>,
}

impl StoreClient {
    /// Create a client for the server at `options.addr`.
    ///
    /// No connection is established up front; each request connects on its
    /// own and rides the retry policy until the server is reachable.
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                addr: options.addr,
                limiter: RequestLimiter::new(options.concurrency),
                retry: RetryConfig::new(options.retry_delay),
                closed: AtomicBool::new(false),
                inflight: options.dedupe_requests.then(|| Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Ask the server process to shut down.
    ///
    /// Fails with [`DepotError::StopRefused`] if the server is configured to
    /// ignore stop requests.
    pub async fn stop_server(&self) -> Result<()> {
        self.call(&Request::Stop).await.map(|_| ())
    }

    /// One limited, retried request/reply exchange.
    pub(crate) async fn call(&self, request: &Request) -> Result<Value> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DepotError::ClientClosed);
        }

        let payload = serde_json::to_vec(request)?;
        let inner = &self.inner;
        retry_transient(&inner.retry, || {
            let payload = payload.clone();
            let inner = inner.clone();
            async move {
                // Re-acquired per attempt so retries stay rate-limited.
                let _permit = inner.limiter.acquire().await?;
                exchange(inner.addr, &payload).await
            }
        })
        .await
    }

    async fn request_package_raw(
        &self,
        dependency: WantedDependency,
        options: Value,
    ) -> Result<PackageResponse> {
        let correlation = CorrelationId::generate();
        let request = Request::RequestPackage {
            id: correlation,
            wanted_dependency: dependency,
            options,
        };
        let reply: RequestPackageReply = serde_json::from_value(self.call(&request).await?)?;

        if reply.is_local {
            let manifest = reply.manifest.ok_or_else(|| DepotError::Validation {
                field: "manifest".to_string(),
                message: "local reply carries no manifest".to_string(),
            })?;
            return Ok(PackageResponse::local(reply.id, manifest));
        }

        let (response, manifest_tx, files_tx) = PackageResponse::pending(reply.id);

        // Fire both phase fetches in parallel right away; each server-side
        // long-poll answers once the matching phase resolves.
        let client = self.clone();
        tokio::spawn(async move {
            match client.call(&Request::ManifestResponse { id: correlation }).await {
                Ok(value) => manifest_tx.resolve(value),
                Err(e) => manifest_tx.reject(ReplyError::from_error(&e)),
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            match client
                .call(&Request::PackageFilesResponse { id: correlation })
                .await
            {
                Ok(value) => match serde_json::from_value::<PackageFilesResponse>(value) {
                    Ok(files) => files_tx.resolve(files),
                    Err(e) => {
                        files_tx.reject(ReplyError::internal(format!("undecodable files reply: {}", e)))
                    }
                },
                Err(e) => files_tx.reject(ReplyError::from_error(&e)),
            }
        });

        Ok(response)
    }

    /// Share one wire exchange between concurrent identical requests.
    ///
    /// The first caller for a key performs the exchange; followers wait on
    /// a clone of its response. The entry is dropped once the shared
    /// response settles, so this is in-flight sharing, not a cache.
    async fn request_package_deduped(
        &self,
        inflight: &Mutex<HashMap<String, Phase<PackageResponse>>>,
        dependency: WantedDependency,
        options: Value,
    ) -> Result<PackageResponse> {
        let key = serde_json::to_string(&(&dependency, &options))?;

        enum Role {
            Leader(PhaseSender<PackageResponse>),
            Follower(Phase<PackageResponse>),
        }

        // Claim or join under one lock guard, so two identical callers can
        // never both become the leader.
        let role = {
            let mut inflight = lock_inflight(inflight)?;
            match inflight.get(&key) {
                Some(phase) => Role::Follower(phase.clone()),
                None => {
                    let (tx, phase) = Phase::channel();
                    inflight.insert(key.clone(), phase);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut phase) => {
                debug!("joining in-flight request for {}", dependency.alias);
                phase.wait().await
            }
            Role::Leader(tx) => match self.request_package_raw(dependency, options).await {
                Ok(response) => {
                    tx.resolve(response.clone());

                    let inner = self.inner.clone();
                    let finished = response.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        let _ = finished.finishing().await;
                        if let Some(inflight) = &inner.inflight {
                            if let Ok(mut inflight) = inflight.lock() {
                                inflight.remove(&key);
                            }
                        }
                    });

                    Ok(response)
                }
                Err(e) => {
                    if let Ok(mut inflight) = lock_inflight(inflight) {
                        inflight.remove(&key);
                    }
                    tx.reject(ReplyError::from_error(&e));
                    Err(e)
                }
            },
        }
    }
}

fn lock_inflight<'a>(
    inflight: &'a Mutex<HashMap<String, Phase<PackageResponse>>>,
) -> Result<std::sync::MutexGuard<'a, HashMap<String, Phase<PackageResponse>>>> {
    inflight
        .lock()
        .map_err(|_| DepotError::Other("dedupe map lock poisoned".to_string()))
}

/// Open a connection, send one frame, read one frame.
async fn exchange(addr: SocketAddr, payload: &[u8]) -> Result<Value> {
    let mut stream = tokio::time::timeout(ProtocolConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| DepotError::Connection {
            message: format!("connect to {} timed out", addr),
            source: Some(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timeout",
            )),
        })??;
    let (mut reader, mut writer) = stream.split();

    write_frame(&mut writer, payload).await?;

    let reply_bytes = read_frame(&mut reader)
        .await?
        .ok_or_else(|| DepotError::connection_lost("connection closed before reply"))?;

    let reply: Reply = serde_json::from_slice(&reply_bytes)?;
    if let Some(error) = reply.error {
        return Err(error.into_error());
    }
    reply.result.ok_or_else(|| DepotError::Validation {
        field: "reply".to_string(),
        message: "reply carries neither result nor error".to_string(),
    })
}

#[async_trait]
impl StoreController for StoreClient {
    async fn request_package(
        &self,
        dependency: WantedDependency,
        options: Value,
    ) -> Result<PackageResponse> {
        match &self.inner.inflight {
            Some(inflight) => {
                self.request_package_deduped(inflight, dependency, options)
                    .await
            }
            None => self.request_package_raw(dependency, options).await,
        }
    }

    async fn update_connections(
        &self,
        prefix: &str,
        options: UpdateConnectionsOptions,
    ) -> Result<()> {
        self.call(&Request::UpdateConnections {
            prefix: prefix.to_string(),
            opts: options,
        })
        .await
        .map(|_| ())
    }

    async fn prune(&self) -> Result<()> {
        self.call(&Request::Prune).await.map(|_| ())
    }

    async fn save_state(&self) -> Result<()> {
        self.call(&Request::SaveState).await.map(|_| ())
    }

    async fn upload(&self, built_pkg_location: &Path, options: UploadOptions) -> Result<()> {
        self.call(&Request::Upload {
            built_pkg_location: built_pkg_location.to_path_buf(),
            opts: options,
        })
        .await
        .map(|_| ())
    }

    /// Fail later calls fast. In-flight phase fetches are deliberately left
    /// running; nothing pending server-side is cancelled.
    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
