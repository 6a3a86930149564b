use crate::cache::{EntityCache, Mutator, QueryKey};
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Applies local patches ahead of server confirmation.
///
/// A patch is an optimistic layer on each target entry. Committing folds it
/// into the confirmed data; undoing removes just that layer, so later
/// mutations and pushed updates survive a rollback.
#[derive(Clone)]
pub struct OptimisticController {
    cache: EntityCache,
    next_id: Arc<AtomicU64>,
}

impl OptimisticController {
    pub fn new(cache: EntityCache) -> Self {
        Self {
            cache,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Layer `patch` over every entry in `keys` that currently holds data.
    pub fn apply(
        &self,
        target: impl Into<String>,
        keys: Vec<QueryKey>,
        patch: Mutator,
    ) -> PatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let target = target.into();
        let keys: Vec<QueryKey> = keys
            .into_iter()
            .filter(|key| self.cache.push_layer(key, id, patch.clone()))
            .collect();
        debug!("Patch {} for {} applied to {} entries", id, target, keys.len());

        PatchHandle {
            id,
            target,
            keys,
            cache: self.cache.clone(),
            settled: false,
        }
    }

    /// Await `request`, then commit the patch on success or roll it back on
    /// failure.
    pub async fn run<T, F>(&self, handle: PatchHandle, request: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        match request.await {
            Ok(value) => {
                handle.commit();
                Ok(value)
            }
            Err(e) => {
                let target = handle.target.clone();
                handle.undo();
                warn!("Rolled back optimistic update for {}: {}", target, e);
                Err(SyncError::ConflictDuringOptimisticUpdate {
                    target,
                    source: Box::new(e),
                })
            }
        }
    }
}

/// An applied patch. Dropping it without committing rolls it back.
pub struct PatchHandle {
    id: u64,
    target: String,
    keys: Vec<QueryKey>,
    cache: EntityCache,
    settled: bool,
}

impl PatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Entries the patch actually landed on.
    pub fn keys(&self) -> &[QueryKey] {
        &self.keys
    }

    pub fn commit(mut self) {
        for key in &self.keys {
            self.cache.commit_layer(key, self.id);
        }
        self.settled = true;
    }

    pub fn undo(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        for key in &self.keys {
            self.cache.remove_layer(key, self.id);
        }
    }
}

impl Drop for PatchHandle {
    fn drop(&mut self) {
        self.rollback();
    }
}
