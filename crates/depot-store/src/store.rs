//! Store controller surface and multi-phase response types.
//!
//! [`StoreController`] is the capability surface of the package store: the
//! server adapter consumes a local implementation, and
//! [`StoreClient`](crate::StoreClient) reproduces the same surface over the
//! wire. A [`PackageResponse`] carries the immediately-known part of a
//! resolution plus two [`Phase`] handles that complete independently.

use crate::ipc::protocol::ReplyError;
use crate::{DepotError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque token linking a `requestPackage` call to its later phase fetches.
///
/// Uniqueness for the lifetime of one outstanding operation is the required
/// property; the token is not a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A dependency the caller wants resolved, passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantedDependency {
    pub alias: String,
    /// Version preference (a range, tag, or exact version).
    pub pref: String,
}

/// Options for `updateConnections`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectionsOptions {
    pub add_dependencies: Vec<String>,
    pub remove_dependencies: Vec<String>,
    pub prune: bool,
}

/// Options for `upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOptions {
    pub engine: String,
    pub pkg_id: String,
}

/// Result of the files phase of a package resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFilesResponse {
    pub from_store: bool,
    pub filenames: Vec<String>,
}

/// What a phase ultimately resolves to: a value, or the collaborator's
/// failure carried verbatim.
pub type PhaseResult<T> = std::result::Result<T, ReplyError>;

/// A cloneable one-shot handle for a deferred phase result.
///
/// Backed by a `watch` channel so a resolved value can be observed by every
/// clone (the finishing step and, with deduplication enabled, every sharing
/// caller). `wait` suspends until the matching [`PhaseSender`] fires; a
/// sender dropped without resolving surfaces as an error, never a hang.
#[derive(Debug, Clone)]
pub struct Phase<T> {
    rx: watch::Receiver<Option<PhaseResult<T>>>,
}

/// Resolving half of a [`Phase`]. Fires exactly once.
#[derive(Debug)]
pub struct PhaseSender<T> {
    tx: watch::Sender<Option<PhaseResult<T>>>,
}

impl<T: Clone> Phase<T> {
    /// An already-resolved phase.
    pub fn ready(value: T) -> Self {
        let (_, rx) = watch::channel(Some(Ok(value)));
        Self { rx }
    }

    /// A pending phase plus its resolving half.
    pub fn channel() -> (PhaseSender<T>, Phase<T>) {
        let (tx, rx) = watch::channel(None);
        (PhaseSender { tx }, Phase { rx })
    }

    /// Whether the phase has resolved yet.
    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Suspend until the phase resolves, then return its value.
    pub async fn wait(&mut self) -> Result<T> {
        self.wait_result().await.map_err(DepotError::from)
    }

    pub(crate) async fn wait_result(&mut self) -> PhaseResult<T> {
        match self.rx.wait_for(|value| value.is_some()).await {
            Ok(guard) => match guard.as_ref() {
                Some(result) => result.clone(),
                None => Err(ReplyError::internal("phase abandoned before resolution")),
            },
            Err(_) => Err(ReplyError::internal("phase abandoned before resolution")),
        }
    }
}

impl<T> PhaseSender<T> {
    /// Resolve the phase with a value.
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Some(Ok(value)));
    }

    /// Resolve the phase with the collaborator's failure.
    pub fn reject(self, error: ReplyError) {
        let _ = self.tx.send(Some(Err(error)));
    }
}

/// Manifest phase handle. Manifests are opaque JSON, forwarded untouched.
pub type ManifestPhase = Phase<Value>;
/// Files phase handle.
pub type FilesPhase = Phase<PackageFilesResponse>;

/// Response to a `request_package` call.
///
/// The immediate part (`id`, `is_local`, inline `manifest` for local
/// packages) is known as soon as resolution finishes; the two phases
/// complete independently and later. If `is_local` is true both phases are
/// pre-resolved and no further round trips happen.
#[derive(Debug, Clone)]
pub struct PackageResponse {
    pub id: String,
    pub is_local: bool,
    /// Present only when `is_local`.
    pub manifest: Option<Value>,
    pub fetching_manifest: ManifestPhase,
    pub fetching_files: FilesPhase,
}

impl PackageResponse {
    /// A response for a package already present locally: both phases are
    /// resolved up front. Local files are already materialized, so the files
    /// phase reports `fromStore` with nothing newly fetched.
    pub fn local(id: impl Into<String>, manifest: Value) -> Self {
        Self {
            id: id.into(),
            is_local: true,
            manifest: Some(manifest.clone()),
            fetching_manifest: Phase::ready(manifest),
            fetching_files: Phase::ready(PackageFilesResponse {
                from_store: true,
                filenames: Vec::new(),
            }),
        }
    }

    /// A response whose phases are still in flight, plus the senders that
    /// will resolve them.
    pub fn pending(
        id: impl Into<String>,
    ) -> (Self, PhaseSender<Value>, PhaseSender<PackageFilesResponse>) {
        let (manifest_tx, fetching_manifest) = Phase::channel();
        let (files_tx, fetching_files) = Phase::channel();
        let response = Self {
            id: id.into(),
            is_local: false,
            manifest: None,
            fetching_manifest,
            fetching_files,
        };
        (response, manifest_tx, files_tx)
    }

    /// Resolve once both phases have, carrying no payload. Fails if either
    /// phase failed.
    pub async fn finishing(&self) -> Result<()> {
        let mut manifest = self.fetching_manifest.clone();
        let mut files = self.fetching_files.clone();
        let (manifest, files) = tokio::join!(manifest.wait_result(), files.wait_result());
        manifest?;
        files?;
        Ok(())
    }
}

/// Capability surface of the package store.
///
/// Consumed by [`StoreServer`](crate::StoreServer) as the local
/// collaborator and reproduced over the wire by
/// [`StoreClient`](crate::StoreClient).
#[async_trait]
pub trait StoreController: Send + Sync + 'static {
    /// Resolve a dependency and start fetching it. The returned response
    /// must not wait for the phases: callers start work on what is already
    /// known while the phases complete in the background.
    async fn request_package(
        &self,
        dependency: WantedDependency,
        options: Value,
    ) -> Result<PackageResponse>;

    async fn update_connections(
        &self,
        prefix: &str,
        options: UpdateConnectionsOptions,
    ) -> Result<()>;

    async fn prune(&self) -> Result<()>;

    async fn save_state(&self) -> Result<()>;

    /// Upload a locally built package into the store's side-effect cache.
    async fn upload(&self, built_pkg_location: &Path, options: UploadOptions) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_correlation_id_serializes_as_string() {
        let id = CorrelationId::generate();
        let json = serde_json::to_value(id).unwrap();
        assert!(json.is_string());
        let back: CorrelationId = serde_json::from_value(json).unwrap();
        assert_eq!(id, back);
    }

    #[tokio::test]
    async fn test_ready_phase_resolves_immediately() {
        let mut phase = Phase::ready(7u32);
        assert!(phase.is_resolved());
        assert_eq!(phase.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_pending_phase_suspends_until_resolved() {
        let (tx, mut phase) = Phase::<u32>::channel();
        assert!(!phase.is_resolved());

        let waiter = tokio::spawn(async move { phase.wait().await });
        tokio::task::yield_now().await;
        tx.resolve(11);

        assert_eq!(waiter.await.unwrap().unwrap(), 11);
    }

    #[tokio::test]
    async fn test_phase_clones_all_observe_the_value() {
        let (tx, phase) = Phase::<u32>::channel();
        let mut a = phase.clone();
        let mut b = phase;
        tx.resolve(3);
        assert_eq!(a.wait().await.unwrap(), 3);
        assert_eq!(b.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dropped_sender_errors_instead_of_hanging() {
        let (tx, mut phase) = Phase::<u32>::channel();
        drop(tx);
        let err = phase.wait().await.unwrap_err();
        assert!(err.to_string().contains("abandoned"));
    }

    #[tokio::test]
    async fn test_local_response_has_resolved_phases() {
        let manifest = serde_json::json!({"name": "is-positive", "version": "1.0.0"});
        let response = PackageResponse::local("registry.npmjs.org/is-positive/1.0.0", manifest);

        assert!(response.is_local);
        assert!(response.manifest.is_some());
        assert!(response.fetching_manifest.is_resolved());
        assert!(response.fetching_files.is_resolved());
        response.finishing().await.unwrap();

        let files = response.fetching_files.clone().wait().await.unwrap();
        assert!(files.from_store);
    }

    #[tokio::test]
    async fn test_finishing_waits_for_both_phases() {
        let (response, manifest_tx, files_tx) = PackageResponse::pending("pkg/1.0.0");

        let finishing = {
            let response = response.clone();
            tokio::spawn(async move { response.finishing().await })
        };
        tokio::task::yield_now().await;
        assert!(!finishing.is_finished());

        manifest_tx.resolve(serde_json::json!({"name": "pkg"}));
        tokio::task::yield_now().await;
        assert!(!finishing.is_finished());

        files_tx.resolve(PackageFilesResponse::default());
        finishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finishing_fails_when_a_phase_fails() {
        let (response, manifest_tx, files_tx) = PackageResponse::pending("pkg/1.0.0");
        manifest_tx.resolve(serde_json::json!({}));
        files_tx.reject(ReplyError::internal("tarball fetch failed"));

        let err = response.finishing().await.unwrap_err();
        assert!(err.to_string().contains("tarball fetch failed"));
    }
}
