//! Request-level orchestration: run a command through the store, then tell
//! the cart and the bus about it. Callers get the committed record back and
//! nothing is announced until the write has landed.

use std::sync::Arc;

use crate::bus::{ChangeKind, ChangeNotification, Topic, UpdateBus};
use crate::error::{BargainError, BargainResult};
use crate::models::{
    Actor, Bargain, BargainId, BargainStatus, BargainedPrice, NewBargain, OpenBargainRequest,
    Party,
};
use crate::negotiation::{Command, Effect};
use crate::pricing::PriceBook;
use crate::store::{BargainStore, Opened};

#[derive(Clone)]
pub struct BargainService {
    store: Arc<dyn BargainStore>,
    bus: UpdateBus,
    prices: Arc<dyn PriceBook>,
}

impl BargainService {
    pub fn new(store: Arc<dyn BargainStore>, bus: UpdateBus, prices: Arc<dyn PriceBook>) -> Self {
        Self { store, bus, prices }
    }

    pub fn store(&self) -> Arc<dyn BargainStore> {
        self.store.clone()
    }

    pub fn bus(&self) -> &UpdateBus {
        &self.bus
    }

    pub fn prices(&self) -> Arc<dyn PriceBook> {
        self.prices.clone()
    }

    /// Vendors open negotiations; an active one for the same product and
    /// supplier is handed back instead of a duplicate.
    pub async fn open(&self, actor: &Actor, req: OpenBargainRequest) -> BargainResult<Opened> {
        if actor.party != Party::Vendor {
            return Err(BargainError::Forbidden("only vendors open bargains".into()));
        }
        let ctx = NewBargain {
            product_id: req.product_id,
            product_name: req.product_name,
            supplier_id: req.supplier_id,
            supplier_name: req.supplier_name,
            vendor_id: actor.user_id,
            vendor_name: req.vendor_name,
            original_price: req.original_price,
            quantity: req.quantity,
            unit: req.unit.unwrap_or_else(|| "kg".to_string()),
        };
        let opened = self.store.create(ctx).await?;
        if opened.created {
            self.announce(&opened.bargain, ChangeKind::Created);
        }
        Ok(opened)
    }

    pub async fn get(&self, actor: &Actor, id: BargainId) -> BargainResult<Bargain> {
        let bargain = self.store.get(id).await?;
        ensure_participant(&bargain, actor)?;
        Ok(bargain)
    }

    /// The caller's bargains, newest first.
    pub async fn list_for(&self, actor: &Actor) -> BargainResult<Vec<Bargain>> {
        let mut bargains = match actor.party {
            Party::Vendor => self.store.list_by_vendor(actor.user_id).await?,
            Party::Supplier => self.store.list_by_supplier(actor.user_id).await?,
        };
        bargains.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(bargains)
    }

    pub async fn attention_count(&self, actor: &Actor) -> BargainResult<usize> {
        Ok(self
            .list_for(actor)
            .await?
            .iter()
            .filter(|b| b.needs_attention(actor.party))
            .count())
    }

    pub async fn post_message(
        &self,
        id: BargainId,
        actor: Actor,
        text: String,
        expected_revision: Option<u64>,
    ) -> BargainResult<Bargain> {
        self.execute(id, Command::PostMessage { actor, text }, expected_revision)
            .await
    }

    pub async fn accept_last_offer(
        &self,
        id: BargainId,
        actor: Actor,
        expected_revision: Option<u64>,
    ) -> BargainResult<Bargain> {
        self.execute(id, Command::AcceptLastOffer { actor }, expected_revision)
            .await
    }

    pub async fn reject_last_offer(
        &self,
        id: BargainId,
        actor: Actor,
        expected_revision: Option<u64>,
    ) -> BargainResult<Bargain> {
        self.execute(id, Command::RejectLastOffer { actor }, expected_revision)
            .await
    }

    pub async fn confirm_deal_done(
        &self,
        id: BargainId,
        actor: Actor,
        expected_revision: Option<u64>,
    ) -> BargainResult<Bargain> {
        self.execute(id, Command::ConfirmDealDone { actor }, expected_revision)
            .await
    }

    /// Checkout callback: the agreed price has been paid.
    pub async fn mark_completed(&self, id: BargainId) -> BargainResult<Bargain> {
        self.execute(id, Command::MarkCompleted, None).await
    }

    /// Completes every agreed bargain of the vendor for the purchased products.
    pub async fn checkout(&self, actor: &Actor, product_ids: &[i64]) -> BargainResult<Vec<Bargain>> {
        if actor.party != Party::Vendor {
            return Err(BargainError::Forbidden("only vendors check out".into()));
        }
        let agreed: Vec<BargainId> = self
            .store
            .list_by_vendor(actor.user_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BargainStatus::Agreed && product_ids.contains(&b.product_id))
            .map(|b| b.id)
            .collect();

        let mut completed = Vec::with_capacity(agreed.len());
        for id in agreed {
            completed.push(self.mark_completed(id).await?);
        }
        log::info!(
            "Checkout by vendor {} completed {} bargain(s)",
            actor.user_id,
            completed.len()
        );
        Ok(completed)
    }

    /// Administrative delete; either participant may remove the record.
    pub async fn delete(&self, actor: &Actor, id: BargainId) -> BargainResult<Bargain> {
        let bargain = self.store.get(id).await?;
        ensure_participant(&bargain, actor)?;
        let removed = self.store.delete(id).await?;
        if removed.status == BargainStatus::Agreed {
            self.prices
                .clear(removed.vendor_id, removed.product_id, removed.id)
                .await;
        }
        self.announce(&removed, ChangeKind::Deleted);
        Ok(removed)
    }

    async fn execute(
        &self,
        id: BargainId,
        command: Command,
        expected_revision: Option<u64>,
    ) -> BargainResult<Bargain> {
        let transition = self.store.append(id, command, expected_revision).await?;
        let bargain = transition.bargain;

        match transition.effect {
            Effect::Unchanged => return Ok(bargain),
            Effect::MessagePosted => {
                self.announce(&bargain, ChangeKind::Message);
                return Ok(bargain);
            }
            Effect::Agreed => {
                if let Some(price) = BargainedPrice::from_agreed(&bargain) {
                    self.prices.publish(price).await;
                }
            }
            Effect::Completed => {
                self.prices
                    .clear(bargain.vendor_id, bargain.product_id, bargain.id)
                    .await;
            }
            Effect::Accepted | Effect::Rejected | Effect::Confirmed => {}
        }
        self.announce(&bargain, ChangeKind::StatusChange);
        Ok(bargain)
    }

    fn announce(&self, bargain: &Bargain, change_kind: ChangeKind) {
        let notification = ChangeNotification {
            bargain_id: bargain.id,
            change_kind,
        };
        for topic in Topic::all_for(bargain) {
            self.bus.publish(topic, notification);
        }
    }
}

fn ensure_participant(bargain: &Bargain, actor: &Actor) -> BargainResult<()> {
    if bargain.involves(actor) {
        Ok(())
    } else {
        Err(BargainError::NotParticipant {
            id: bargain.id,
            user_id: actor.user_id,
            party: actor.party,
        })
    }
}
