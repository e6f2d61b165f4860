//! Server adapter: binds a listening endpoint and serves the store protocol.
//!
//! Listens on a local TCP address, accepts connections, and dispatches
//! decoded requests to a local [`StoreController`]. A `requestPackage` reply
//! goes out as soon as the immediate part is known; the deferred phases are
//! pumped into the [`PhaseRegistry`] by background tasks and handed out by
//! the long-polling phase-fetch handlers.
//!
//! # Thread Safety
//!
//! Each connection is handled in its own spawned task. The store and the
//! registry are shared via `Arc`; registry mutations happen inside
//! non-suspending critical sections, so interleaved handlers cannot race a
//! check against a mutation.

use super::protocol::{read_frame, write_frame, Reply, Request, RequestPackageReply};
use crate::config::ServerOptions;
use crate::registry::PhaseRegistry;
use crate::store::{CorrelationId, StoreController, WantedDependency};
use crate::{DepotError, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Handle to a running store server. Dropping shuts down the server.
pub struct StoreServerHandle {
    addr: SocketAddr,
    registry: Arc<PhaseRegistry>,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl StoreServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of multi-phase responses currently awaiting phase fetches.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for StoreServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Store protocol server.
pub struct StoreServer;

impl StoreServer {
    /// Start serving `store` per `options`.
    ///
    /// Returns a handle carrying the bound address. The server runs in
    /// background tasks until the handle shuts it down or a permitted remote
    /// `stop` request arrives.
    pub async fn start<S: StoreController>(
        store: Arc<S>,
        options: ServerOptions,
    ) -> Result<StoreServerHandle> {
        let listener = TcpListener::bind(options.bind).await?;
        let addr = listener.local_addr()?;

        info!("store server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(PhaseRegistry::new());
        let adapter = Arc::new(Adapter {
            store,
            registry: registry.clone(),
            ignore_stop_requests: options.ignore_stop_requests,
            shutdown_tx: shutdown_tx.clone(),
        });

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            adapter,
            shutdown_rx,
            options.max_connections,
        ));

        Ok(StoreServerHandle {
            addr,
            registry,
            shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<S: StoreController>(
        listener: TcpListener,
        adapter: Arc<Adapter<S>>,
        mut shutdown_rx: watch::Receiver<bool>,
        max_connections: usize,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("store server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "rejecting connection from {}: at max capacity ({})",
                                    peer_addr, max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let adapter = adapter.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("connection from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, &adapter, &mut conn_shutdown).await
                                {
                                    debug!("connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<S: StoreController>(
        mut stream: TcpStream,
        adapter: &Adapter<S>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            // Wait for either a frame or a shutdown signal
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(()); // Server shutting down
                }
            };

            let (reply, stop_after_reply) = adapter.process(&frame).await;

            let reply_bytes = serde_json::to_vec(&reply)?;
            write_frame(&mut writer, &reply_bytes).await?;

            if stop_after_reply {
                // Acknowledge first, then bring the whole server down.
                info!("shutting down on remote stop request");
                let _ = adapter.shutdown_tx.send(true);
                return Ok(());
            }
        }
    }
}

/// Per-server dispatch state: the local store, the phase registry it owns,
/// and the shutdown signal for remote stop requests.
struct Adapter<S> {
    store: Arc<S>,
    registry: Arc<PhaseRegistry>,
    ignore_stop_requests: bool,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: StoreController> Adapter<S> {
    /// Decode and dispatch one request. The second value asks the
    /// connection handler to shut the server down after replying.
    async fn process(&self, payload: &[u8]) -> (Reply, bool) {
        let request: Request = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(e) => {
                // Malformed input never touches registry state.
                return (
                    Reply::failure(&DepotError::Json {
                        message: format!("unparseable request: {}", e),
                        source: Some(e),
                    }),
                    false,
                );
            }
        };

        let stop_requested = matches!(request, Request::Stop);
        let result = self.dispatch(request).await;
        let stop_after_reply = stop_requested && result.is_ok();

        let reply = match result {
            Ok(value) => Reply::success(value),
            Err(e) => Reply::failure(&e),
        };
        (reply, stop_after_reply)
    }

    async fn dispatch(&self, request: Request) -> Result<Value> {
        match request {
            Request::RequestPackage {
                id,
                wanted_dependency,
                options,
            } => self.request_package(id, wanted_dependency, options).await,
            Request::ManifestResponse { id } => self.registry.consume_manifest(id).await,
            Request::PackageFilesResponse { id } => {
                let files = self.registry.consume_files(id).await?;
                Ok(serde_json::to_value(files)?)
            }
            Request::UpdateConnections { prefix, opts } => {
                self.store.update_connections(&prefix, opts).await?;
                Ok(Value::from("OK"))
            }
            Request::Prune => {
                self.store.prune().await?;
                Ok(Value::from("OK"))
            }
            Request::SaveState => {
                self.store.save_state().await?;
                Ok(Value::from("OK"))
            }
            Request::Upload {
                built_pkg_location,
                opts,
            } => {
                self.store.upload(&built_pkg_location, opts).await?;
                Ok(Value::from("OK"))
            }
            Request::Stop => {
                if self.ignore_stop_requests {
                    Err(DepotError::StopRefused)
                } else {
                    Ok(Value::from("OK"))
                }
            }
        }
    }

    /// Call the local store and reply with the immediate part right away.
    ///
    /// The phases must not be awaited here: the caller starts work on what
    /// is already known while background tasks pump the store's phase
    /// handles into the registry.
    async fn request_package(
        &self,
        id: CorrelationId,
        dependency: WantedDependency,
        options: Value,
    ) -> Result<Value> {
        let response = self.store.request_package(dependency, options).await?;

        if !response.is_local {
            self.registry.create(id)?;

            let registry = self.registry.clone();
            let mut manifest = response.fetching_manifest.clone();
            tokio::spawn(async move {
                let result = manifest.wait_result().await;
                if let Err(e) = registry.resolve_manifest(id, result) {
                    debug!("manifest resolution for {} dropped: {}", id, e);
                }
            });

            let registry = self.registry.clone();
            let mut files = response.fetching_files.clone();
            tokio::spawn(async move {
                let result = files.wait_result().await;
                if let Err(e) = registry.resolve_files(id, result) {
                    debug!("files resolution for {} dropped: {}", id, e);
                }
            });
        }

        let reply = RequestPackageReply {
            id: response.id,
            is_local: response.is_local,
            manifest: if response.is_local {
                response.manifest
            } else {
                None
            },
        };
        Ok(serde_json::to_value(reply)?)
    }
}
