use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::decode::Decoder;
use crate::types::{Dimensions, ResourceId};

use super::{CacheContents, CacheError, CacheKey, MemoryPressure, MemoryStore, PersistentStore};

/// Ties the [`MemoryStore`], the [`PersistentStore`] and the [`Decoder`] together.
///
/// The coordinator derives cache keys, walks the tiers in order, and runs every blocking
/// operation (file-system I/O and decoding) on the blocking pool of its runtime.
pub struct CacheCoordinator<D: Decoder> {
    memory: Arc<MemoryStore<D::Item>>,
    persistent: Option<PersistentStore>,
    decoder: Arc<D>,
    runtime: Handle,
    repopulate_memory: bool,
}

impl<D: Decoder> Clone for CacheCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            memory: self.memory.clone(),
            persistent: self.persistent.clone(),
            decoder: self.decoder.clone(),
            runtime: self.runtime.clone(),
            repopulate_memory: self.repopulate_memory,
        }
    }
}

impl<D: Decoder> fmt::Debug for CacheCoordinator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("memory", &self.memory)
            .field("persistent", &self.persistent)
            .field("repopulate_memory", &self.repopulate_memory)
            .finish()
    }
}

impl<D: Decoder> CacheCoordinator<D> {
    pub fn new(
        memory: Arc<MemoryStore<D::Item>>,
        persistent: Option<PersistentStore>,
        decoder: Arc<D>,
        runtime: Handle,
        repopulate_memory: bool,
    ) -> Self {
        Self {
            memory,
            persistent,
            decoder,
            runtime,
            repopulate_memory,
        }
    }

    pub fn memory(&self) -> &MemoryStore<D::Item> {
        &self.memory
    }

    pub fn persistent(&self) -> Option<&PersistentStore> {
        self.persistent.as_ref()
    }

    /// Whether payloads decoded from a disk hit are written back to the memory tier.
    pub fn repopulates_memory(&self) -> bool {
        self.repopulate_memory
    }

    /// Looks up `id` in both cache tiers.
    ///
    /// A memory hit is returned right away. A disk hit is decoded on the blocking pool and,
    /// if configured, stored in the memory tier. Returns `None` if neither tier has an entry.
    pub async fn resolve(
        &self,
        id: &ResourceId,
        size_hint: Option<Dimensions>,
    ) -> Option<Arc<D::Item>> {
        if let Some(payload) = self.lookup_memory(id, size_hint) {
            return Some(payload);
        }

        let data = self.load_from_disk(id, size_hint).await?;
        match self.decode(data, size_hint).await {
            Ok(payload) => {
                if self.repopulate_memory {
                    self.store(id, size_hint, payload.clone());
                }
                Some(payload)
            }
            Err(error) => {
                // a blob that can not be decoded is useless, let the caller fetch it again
                tracing::warn!(%id, %error, "Discarding undecodable cache entry");
                self.discard_from_disk(id, size_hint).await;
                None
            }
        }
    }

    /// Looks up `id` in the memory tier, first at the size-specific, then at the size-agnostic
    /// key.
    pub fn lookup_memory(
        &self,
        id: &ResourceId,
        size_hint: Option<Dimensions>,
    ) -> Option<Arc<D::Item>> {
        if let Some(size) = size_hint
            && let Some(payload) = self.memory.get(&CacheKey::for_rendition(id, size))
        {
            tracing::trace!(%id, %size, "Memory cache hit");
            return Some(payload);
        }

        let payload = self.memory.get(&CacheKey::for_resource(id));
        match payload {
            Some(_) => tracing::trace!(%id, "Memory cache hit"),
            None => tracing::trace!(%id, "Memory cache miss"),
        }
        payload
    }

    /// Reads the raw bytes of `id` from the persistent tier, first at the size-specific, then at
    /// the size-agnostic key.
    ///
    /// Errors are logged and reported as a miss.
    pub async fn load_from_disk(
        &self,
        id: &ResourceId,
        size_hint: Option<Dimensions>,
    ) -> Option<Bytes> {
        let store = self.persistent.clone()?;

        let mut keys = Vec::with_capacity(2);
        if let Some(size) = size_hint {
            keys.push(CacheKey::for_rendition(id, size));
        }
        keys.push(CacheKey::for_resource(id));
        keys.retain(|key| store.contains(key));
        if keys.is_empty() {
            tracing::trace!(%id, "Persistent cache miss");
            return None;
        }

        let lookup = self.runtime.spawn_blocking(move || {
            for key in keys {
                match store.get(&key) {
                    Ok(Some(data)) => {
                        tracing::trace!(%key, "Persistent cache hit");
                        return Some(data);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(
                        %key,
                        error = &e as &dyn std::error::Error,
                        "Failed to read cache entry"
                    ),
                }
            }
            None
        });

        match lookup.await {
            Ok(data) => data,
            Err(e) => {
                CacheError::from_std_error(e);
                None
            }
        }
    }

    /// Removes the entries [`load_from_disk`](Self::load_from_disk) may have read for `id`.
    pub async fn discard_from_disk(&self, id: &ResourceId, size_hint: Option<Dimensions>) {
        if let Some(size) = size_hint {
            self.remove_from_disk(CacheKey::for_rendition(id, size)).await;
        }
        self.remove_from_disk(CacheKey::for_resource(id)).await;
    }

    /// Writes `data` to the persistent tier under `key`.
    ///
    /// This is best-effort: if the key is currently being written, or the write fails, the
    /// entry is simply not cached.
    pub async fn persist(&self, key: CacheKey, data: Bytes) {
        let Some(store) = self.persistent.clone() else {
            return;
        };

        let write = self.runtime.spawn_blocking(move || {
            let Some(mut editor) = store.edit(&key)? else {
                return Ok(false);
            };
            // a failed write drops the editor, which discards the temporary file
            editor.write(&data)?;
            editor.commit()?;
            Ok::<_, std::io::Error>(true)
        });

        match write.await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => tracing::trace!("Skipped persisting an entry that is being written"),
            Ok(Err(e)) => tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to persist cache entry"
            ),
            Err(e) => {
                CacheError::from_std_error(e);
            }
        }
    }

    /// Decodes `data` on the blocking pool.
    pub async fn decode(
        &self,
        data: Bytes,
        size_hint: Option<Dimensions>,
    ) -> CacheContents<Arc<D::Item>> {
        let decoder = self.decoder.clone();
        let decode = self
            .runtime
            .spawn_blocking(move || decoder.decode(&data, size_hint).map(Arc::new));

        decode.await.map_err(CacheError::from_std_error)?
    }

    /// Stores a decoded payload in the memory tier, under the key matching its size hint.
    pub fn store(&self, id: &ResourceId, size_hint: Option<Dimensions>, payload: Arc<D::Item>) {
        self.memory.put(CacheKey::for_hint(id, size_hint), payload);
    }

    /// Removes every cached rendition of `id`.
    ///
    /// This covers all size-specific entries in memory. On disk, only the size-agnostic entry
    /// can be found by id.
    pub async fn remove(&self, id: &ResourceId) {
        let key = CacheKey::for_resource(id);
        self.memory.remove(&key);
        self.memory.remove_by_prefix(&format!("{}@", key.as_str()));
        self.remove_from_disk(key).await;
    }

    /// Removes all memory entries of resources whose id starts with `prefix`.
    pub fn remove_by_prefix(&self, prefix: &str) -> usize {
        self.memory.remove_by_prefix(&CacheKey::prefix(prefix)).len()
    }

    /// Wipes both tiers.
    pub async fn clear(&self) -> CacheContents {
        self.memory.evict_all();

        let Some(store) = self.persistent.clone() else {
            return Ok(());
        };
        self.runtime
            .spawn_blocking(move || store.delete())
            .await
            .map_err(CacheError::from_std_error)??;
        Ok(())
    }

    /// Reacts to a memory-pressure signal.
    pub fn on_pressure(&self, pressure: MemoryPressure) {
        tracing::debug!(?pressure, "Received memory pressure signal");
        self.memory.on_pressure(pressure);
    }

    /// Reacts to the system running low on memory.
    pub fn on_low_memory(&self) {
        self.on_pressure(MemoryPressure::Severe);
    }

    async fn remove_from_disk(&self, key: CacheKey) {
        let Some(store) = self.persistent.clone() else {
            return;
        };
        let remove = self.runtime.spawn_blocking(move || store.remove(&key));
        match remove.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to remove cache entry"
            ),
            Err(e) => {
                CacheError::from_std_error(e);
            }
        }
    }
}
