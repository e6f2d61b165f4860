//! Per-server registry of in-flight multi-phase responses.
//!
//! Each entry pairs a correlation id with two one-shot result slots
//! (manifest, files). The server adapter resolves the slots as the local
//! store's phases complete; the phase-fetch handlers consume them. Every
//! instance owns its map exclusively, so multiple servers coexist in one
//! process without cross-talk.
//!
//! Lock discipline: the map mutex is only held across non-suspending
//! sections. Consumers claim a slot under the lock, then wait on the slot's
//! channel with the lock released.

use crate::ipc::protocol::ReplyError;
use crate::store::{CorrelationId, PackageFilesResponse, PhaseResult};
use crate::{DepotError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Which side of a multi-phase response a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Manifest,
    Files,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Manifest => "manifest",
            PhaseKind::Files => "files",
        }
    }

    pub(crate) fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "manifest" => Some(PhaseKind::Manifest),
            "files" => Some(PhaseKind::Files),
            _ => None,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot result slot: fulfilled exactly once, consumed exactly once.
struct Slot<T> {
    tx: watch::Sender<Option<PhaseResult<T>>>,
    rx: watch::Receiver<Option<PhaseResult<T>>>,
    resolved: bool,
    claimed: bool,
    delivered: bool,
}

impl<T> Slot<T> {
    fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx,
            rx,
            resolved: false,
            claimed: false,
            delivered: false,
        }
    }
}

struct PhaseEntry {
    manifest: Slot<Value>,
    files: Slot<PackageFilesResponse>,
}

/// Map from correlation id to the two deferred phase results of one
/// in-flight `requestPackage`.
///
/// Entries are created atomically with the initial reply and evicted
/// synchronously with delivery of the second consumed side, so the entry
/// count never exceeds the number of in-flight multi-phase requests.
#[derive(Default)]
pub struct PhaseRegistry {
    entries: Mutex<HashMap<CorrelationId, PhaseEntry>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<CorrelationId, PhaseEntry>>> {
        self.entries
            .lock()
            .map_err(|_| DepotError::Other("phase registry lock poisoned".to_string()))
    }

    /// Allocate the two slots for `id`.
    pub fn create(&self, id: CorrelationId) -> Result<()> {
        let mut entries = self.lock()?;
        if entries.contains_key(&id) {
            return Err(DepotError::DuplicateCorrelation { id });
        }
        entries.insert(
            id,
            PhaseEntry {
                manifest: Slot::new(),
                files: Slot::new(),
            },
        );
        Ok(())
    }

    /// Fulfill the manifest slot of `id` exactly once.
    pub fn resolve_manifest(&self, id: CorrelationId, result: PhaseResult<Value>) -> Result<()> {
        self.resolve(id, PhaseKind::Manifest, |entry| &mut entry.manifest, result)
    }

    /// Fulfill the files slot of `id` exactly once.
    pub fn resolve_files(
        &self,
        id: CorrelationId,
        result: PhaseResult<PackageFilesResponse>,
    ) -> Result<()> {
        self.resolve(id, PhaseKind::Files, |entry| &mut entry.files, result)
    }

    /// Suspend until the manifest slot of `id` resolves, then consume it.
    pub async fn consume_manifest(&self, id: CorrelationId) -> Result<Value> {
        self.consume(id, PhaseKind::Manifest, |entry| &mut entry.manifest)
            .await
    }

    /// Suspend until the files slot of `id` resolves, then consume it.
    pub async fn consume_files(&self, id: CorrelationId) -> Result<PackageFilesResponse> {
        self.consume(id, PhaseKind::Files, |entry| &mut entry.files)
            .await
    }

    /// Number of in-flight entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve<T>(
        &self,
        id: CorrelationId,
        phase: PhaseKind,
        slot_of: impl Fn(&mut PhaseEntry) -> &mut Slot<T>,
        result: PhaseResult<T>,
    ) -> Result<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&id)
            .ok_or(DepotError::UnknownCorrelation { id })?;
        let slot = slot_of(entry);
        if slot.resolved {
            return Err(DepotError::AlreadyResolved { id, phase });
        }
        slot.resolved = true;
        let _ = slot.tx.send(Some(result));
        Ok(())
    }

    async fn consume<T: Clone>(
        &self,
        id: CorrelationId,
        phase: PhaseKind,
        slot_of: impl Fn(&mut PhaseEntry) -> &mut Slot<T>,
    ) -> Result<T> {
        // Claim the slot under the lock, then wait with the lock released so
        // an unresolved slot suspends only this caller.
        let mut rx = {
            let mut entries = self.lock()?;
            let entry = entries
                .get_mut(&id)
                .ok_or(DepotError::UnknownCorrelation { id })?;
            let slot = slot_of(entry);
            if slot.claimed {
                return Err(DepotError::AlreadyConsumed { id, phase });
            }
            slot.claimed = true;
            slot.rx.clone()
        };

        let result = match rx.wait_for(|value| value.is_some()).await {
            Ok(guard) => match guard.as_ref() {
                Some(result) => result.clone(),
                None => Err(ReplyError::internal("phase slot abandoned")),
            },
            Err(_) => Err(ReplyError::internal("phase slot abandoned")),
        };

        // Mark delivery and evict the whole entry together with the second
        // side's delivery. The entry must never be observable afterwards.
        {
            let mut entries = self.lock()?;
            if let Some(entry) = entries.get_mut(&id) {
                slot_of(entry).delivered = true;
                if entry.manifest.delivered && entry.files.delivered {
                    entries.remove(&id);
                    debug!("evicted phase entry for {}", id);
                }
            }
        }

        result.map_err(DepotError::from)
    }
}
