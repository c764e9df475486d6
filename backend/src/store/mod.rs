//! Authoritative bargain records.
//!
//! Writes go through [`BargainStore::append`], which applies a negotiation
//! [`Command`] to whatever is stored *now*, never to a copy the caller holds.
//! Appends to the same bargain serialize; different bargains never wait on
//! each other.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use crate::error::{BargainError, BargainResult};
use crate::models::{Bargain, BargainId, NewBargain};
use crate::negotiation::{self, Command, Transition};

#[cfg(feature = "postgres")]
pub mod postgres;

/// Result of [`BargainStore::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct Opened {
    pub bargain: Bargain,
    /// `false` when an active bargain for the same key was handed back instead.
    pub created: bool,
}

#[async_trait]
pub trait BargainStore: Send + Sync {
    /// Open a bargain, or return the active one for the same
    /// `(product, vendor, supplier)` key.
    async fn create(&self, ctx: NewBargain) -> BargainResult<Opened>;

    async fn get(&self, id: BargainId) -> BargainResult<Bargain>;

    /// Read-modify-write under the bargain's own lock. With
    /// `expected_revision` set, a record that has moved on is refused with
    /// `ConcurrentWriteConflict`.
    async fn append(
        &self,
        id: BargainId,
        command: Command,
        expected_revision: Option<u64>,
    ) -> BargainResult<Transition>;

    /// Ordered by id (creation order).
    async fn list_by_supplier(&self, supplier_id: i64) -> BargainResult<Vec<Bargain>>;

    /// Ordered by id (creation order).
    async fn list_by_vendor(&self, vendor_id: i64) -> BargainResult<Vec<Bargain>>;

    /// Administrative removal, outside the negotiation protocol.
    async fn delete(&self, id: BargainId) -> BargainResult<Bargain>;
}

pub(crate) fn check_revision(current: &Bargain, expected: Option<u64>) -> BargainResult<()> {
    match expected {
        Some(expected) if expected != current.revision => {
            Err(BargainError::ConcurrentWriteConflict {
                id: current.id,
                expected,
                found: current.revision,
            })
        }
        _ => Ok(()),
    }
}

type Slot = Arc<Mutex<Bargain>>;

/// In-process store. Each record sits behind its own async mutex; the map
/// lock is only held long enough to clone a slot handle.
pub struct MemoryStore {
    next_id: AtomicI64,
    records: RwLock<HashMap<BargainId, Slot>>,
    // Serializes the "find active or insert" check in `create`.
    opening: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            records: RwLock::new(HashMap::new()),
            opening: Mutex::new(()),
        }
    }

    fn slot(&self, id: BargainId) -> BargainResult<Slot> {
        let records = self
            .records
            .read()
            .map_err(|e| BargainError::Storage(e.to_string()))?;
        records.get(&id).cloned().ok_or(BargainError::NotFound(id))
    }

    fn slots(&self) -> BargainResult<Vec<(BargainId, Slot)>> {
        let records = self
            .records
            .read()
            .map_err(|e| BargainError::Storage(e.to_string()))?;
        let mut slots: Vec<_> = records.iter().map(|(id, s)| (*id, s.clone())).collect();
        slots.sort_by_key(|(id, _)| *id);
        Ok(slots)
    }

    async fn list_where<F>(&self, keep: F) -> BargainResult<Vec<Bargain>>
    where
        F: Fn(&Bargain) -> bool + Send,
    {
        let mut out = Vec::new();
        for (_, slot) in self.slots()? {
            let bargain = slot.lock().await;
            if keep(&bargain) {
                out.push(bargain.clone());
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BargainStore for MemoryStore {
    async fn create(&self, ctx: NewBargain) -> BargainResult<Opened> {
        let _opening = self.opening.lock().await;
        let key = ctx.key();

        for (_, slot) in self.slots()? {
            let existing = slot.lock().await;
            if existing.key() == key && existing.status.is_active() {
                log::info!(
                    "Reusing bargain {} for product {} (vendor {}, supplier {})",
                    existing.id,
                    key.product_id,
                    key.vendor_id,
                    key.supplier_id
                );
                return Ok(Opened {
                    bargain: existing.clone(),
                    created: false,
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bargain = Bargain::open(id, ctx, Utc::now());
        self.records
            .write()
            .map_err(|e| BargainError::Storage(e.to_string()))?
            .insert(id, Arc::new(Mutex::new(bargain.clone())));
        log::info!(
            "Created bargain {} for product {} (vendor {}, supplier {})",
            id,
            key.product_id,
            key.vendor_id,
            key.supplier_id
        );
        Ok(Opened {
            bargain,
            created: true,
        })
    }

    async fn get(&self, id: BargainId) -> BargainResult<Bargain> {
        let slot = self.slot(id)?;
        let bargain = slot.lock().await;
        Ok(bargain.clone())
    }

    async fn append(
        &self,
        id: BargainId,
        command: Command,
        expected_revision: Option<u64>,
    ) -> BargainResult<Transition> {
        let slot = self.slot(id)?;
        let mut stored = slot.lock().await;
        check_revision(&stored, expected_revision)?;

        let transition = negotiation::apply(&stored, &command, Utc::now())?;
        debug_assert!(transition.bargain.check_invariants().is_ok());
        *stored = transition.bargain.clone();
        log::debug!(
            "Bargain {} {} -> {:?} (revision {})",
            id,
            command.name(),
            transition.effect,
            stored.revision
        );
        Ok(transition)
    }

    async fn list_by_supplier(&self, supplier_id: i64) -> BargainResult<Vec<Bargain>> {
        self.list_where(move |b| b.supplier_id == supplier_id).await
    }

    async fn list_by_vendor(&self, vendor_id: i64) -> BargainResult<Vec<Bargain>> {
        self.list_where(move |b| b.vendor_id == vendor_id).await
    }

    async fn delete(&self, id: BargainId) -> BargainResult<Bargain> {
        let slot = self
            .records
            .write()
            .map_err(|e| BargainError::Storage(e.to_string()))?
            .remove(&id)
            .ok_or(BargainError::NotFound(id))?;
        // Wait out any append still holding the record.
        let bargain = slot.lock().await;
        log::info!("Deleted bargain {}", id);
        Ok(bargain.clone())
    }
}
