//! Local projections kept in step with the store.
//!
//! A view never edits its copy. On any notification it asks the store for the
//! current record and swaps it in whole, which makes replays harmless and
//! leaves no room for an optimistic state the store never committed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::bus::{ChangeHandler, ChangeNotification, Subscription, Topic, UpdateBus};
use crate::error::{BargainError, BargainResult};
use crate::models::{Actor, Bargain, BargainId, Party};
use crate::store::BargainStore;

/// One open negotiation window.
pub struct BargainView {
    id: BargainId,
    store: Arc<dyn BargainStore>,
    local: RwLock<Option<Bargain>>,
    reloads: AtomicU64,
}

impl BargainView {
    pub async fn open(store: Arc<dyn BargainStore>, id: BargainId) -> BargainResult<Arc<Self>> {
        let bargain = store.get(id).await?;
        Ok(Arc::new(Self {
            id,
            store,
            local: RwLock::new(Some(bargain)),
            reloads: AtomicU64::new(0),
        }))
    }

    /// Listen for changes to this bargain until the subscription is dropped.
    pub fn attach(self: &Arc<Self>, bus: &UpdateBus) -> Subscription {
        bus.subscribe(Topic::Bargain(self.id), self.clone())
    }

    pub fn id(&self) -> BargainId {
        self.id
    }

    /// `None` once the bargain has been deleted.
    pub async fn snapshot(&self) -> Option<Bargain> {
        self.local.read().await.clone()
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub async fn reload(&self) -> BargainResult<()> {
        // Held across the read so concurrent reloads land in order.
        let mut local = self.local.write().await;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        match self.store.get(self.id).await {
            Ok(bargain) => {
                *local = Some(bargain);
                Ok(())
            }
            Err(BargainError::NotFound(_)) => {
                *local = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChangeHandler for BargainView {
    async fn on_change(&self, notification: ChangeNotification) {
        if notification.bargain_id != self.id {
            return;
        }
        if let Err(e) = self.reload().await {
            log::warn!("Could not reload bargain {}: {}", self.id, e);
        }
    }

    async fn on_resync(&self) {
        if let Err(e) = self.reload().await {
            log::warn!("Could not resync bargain {}: {}", self.id, e);
        }
    }
}

/// A party's list of bargains, e.g. the supplier dashboard or the vendor's
/// bargains page, with the badge count derived from it.
pub struct PartyInbox {
    actor: Actor,
    store: Arc<dyn BargainStore>,
    bargains: RwLock<Vec<Bargain>>,
}

impl PartyInbox {
    pub async fn open(store: Arc<dyn BargainStore>, actor: Actor) -> BargainResult<Arc<Self>> {
        let inbox = Arc::new(Self {
            actor,
            store,
            bargains: RwLock::new(Vec::new()),
        });
        inbox.reload().await?;
        Ok(inbox)
    }

    pub fn topic(&self) -> Topic {
        match self.actor.party {
            Party::Vendor => Topic::Vendor(self.actor.user_id),
            Party::Supplier => Topic::Supplier(self.actor.user_id),
        }
    }

    pub fn attach(self: &Arc<Self>, bus: &UpdateBus) -> Subscription {
        bus.subscribe(self.topic(), self.clone())
    }

    /// Newest first.
    pub async fn bargains(&self) -> Vec<Bargain> {
        self.bargains.read().await.clone()
    }

    pub async fn attention_count(&self) -> usize {
        self.bargains
            .read()
            .await
            .iter()
            .filter(|b| b.needs_attention(self.actor.party))
            .count()
    }

    pub async fn reload(&self) -> BargainResult<()> {
        let mut local = self.bargains.write().await;
        let mut fresh = match self.actor.party {
            Party::Vendor => self.store.list_by_vendor(self.actor.user_id).await?,
            Party::Supplier => self.store.list_by_supplier(self.actor.user_id).await?,
        };
        fresh.sort_by(|a, b| b.id.cmp(&a.id));
        *local = fresh;
        Ok(())
    }
}

#[async_trait]
impl ChangeHandler for PartyInbox {
    async fn on_change(&self, notification: ChangeNotification) {
        if let Err(e) = self.reload().await {
            log::warn!(
                "Could not refresh {} {} after change to bargain {}: {}",
                self.actor.party,
                self.actor.user_id,
                notification.bargain_id,
                e
            );
        }
    }

    async fn on_resync(&self) {
        if let Err(e) = self.reload().await {
            log::warn!(
                "Could not resync {} {}: {}",
                self.actor.party,
                self.actor.user_id,
                e
            );
        }
    }
}
