//! Outbound boundary to the cart: negotiated per-unit prices that override
//! the list price for a vendor's line item until the purchase goes through.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{BargainId, BargainedPrice};

#[async_trait]
pub trait PriceBook: Send + Sync {
    /// Called once when a bargain becomes `agreed`.
    async fn publish(&self, price: BargainedPrice);

    /// Called when the bargain is consumed by a purchase or deleted. Only the
    /// override that `bargain_id` published is removed.
    async fn clear(&self, vendor_id: i64, product_id: i64, bargain_id: BargainId);

    async fn lookup(&self, vendor_id: i64, product_id: i64) -> Option<BargainedPrice>;

    async fn for_vendor(&self, vendor_id: i64) -> Vec<BargainedPrice>;
}

/// In-memory price overrides keyed by `(vendor, product)`.
#[derive(Default)]
pub struct CartPriceBook {
    prices: RwLock<HashMap<(i64, i64), BargainedPrice>>,
}

impl CartPriceBook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PriceBook for CartPriceBook {
    async fn publish(&self, price: BargainedPrice) {
        log::info!(
            "Bargained price {}/{} for product {} (vendor {}, supplier {})",
            price.bargained_price_per_unit,
            price.unit,
            price.product_id,
            price.vendor_id,
            price.supplier_id
        );
        self.prices
            .write()
            .await
            .insert((price.vendor_id, price.product_id), price);
    }

    async fn clear(&self, vendor_id: i64, product_id: i64, bargain_id: BargainId) {
        let mut prices = self.prices.write().await;
        let key = (vendor_id, product_id);
        match prices.get(&key) {
            Some(current) if current.bargain_id == bargain_id => {
                prices.remove(&key);
                log::info!(
                    "Cleared bargained price of bargain {} for product {} (vendor {})",
                    bargain_id,
                    product_id,
                    vendor_id
                );
            }
            Some(current) => log::debug!(
                "Kept price of bargain {} for product {}; bargain {} no longer owns it",
                current.bargain_id,
                product_id,
                bargain_id
            ),
            None => {}
        }
    }

    async fn lookup(&self, vendor_id: i64, product_id: i64) -> Option<BargainedPrice> {
        self.prices.read().await.get(&(vendor_id, product_id)).cloned()
    }

    async fn for_vendor(&self, vendor_id: i64) -> Vec<BargainedPrice> {
        let mut out: Vec<_> = self
            .prices
            .read()
            .await
            .values()
            .filter(|p| p.vendor_id == vendor_id)
            .cloned()
            .collect();
        out.sort_by_key(|p| p.product_id);
        out
    }
}
