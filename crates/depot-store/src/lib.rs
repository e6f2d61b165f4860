//! depot-store — shared package store server and client.
//!
//! Lets any number of concurrent package-manager invocations share one
//! package store living in another process. A store exposes the
//! [`StoreController`] surface; [`StoreServer`] serves it over a local
//! socket and [`StoreClient`] reproduces the same surface on the other
//! side, so callers cannot tell a remote store from a local one.
//!
//! A `request_package` call completes in three parts: the immediate reply
//! (package id, locality, inline manifest for local packages) and two
//! deferred phases (manifest, files) that the server resolves in the
//! background and the client picks up with long-polling fetches, correlated
//! by an opaque [`CorrelationId`].
//!
//! # Example
//!
//! ```rust,ignore
//! use depot_store::{ConnectOptions, ServerOptions, StoreClient, StoreController, StoreServer};
//!
//! # async fn run(store: std::sync::Arc<impl StoreController>) -> depot_store::Result<()> {
//! let server = StoreServer::start(store, ServerOptions::new()).await?;
//!
//! let client = StoreClient::new(ConnectOptions::new(server.addr()));
//! let response = client
//!     .request_package(
//!         depot_store::WantedDependency {
//!             alias: "is-positive".into(),
//!             pref: "1.0.0".into(),
//!         },
//!         serde_json::json!({ "registry": "https://registry.npmjs.org/" }),
//!     )
//!     .await?;
//!
//! let manifest = response.fetching_manifest.clone().wait().await?;
//! response.finishing().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ipc;
pub mod limit;
pub mod registry;
pub mod retry;
pub mod store;

// Re-export commonly used types
pub use config::{ConnectOptions, ProtocolConfig, ServerOptions};
pub use error::{DepotError, Result};
pub use ipc::{StoreClient, StoreServer, StoreServerHandle};
pub use limit::{RequestLimiter, RequestPermit};
pub use registry::{PhaseKind, PhaseRegistry};
pub use retry::{retry_transient, RetryConfig};
pub use store::{
    CorrelationId, FilesPhase, ManifestPhase, PackageFilesResponse, PackageResponse, Phase,
    PhaseSender, StoreController, UpdateConnectionsOptions, UploadOptions, WantedDependency,
};
