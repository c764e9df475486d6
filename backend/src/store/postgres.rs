//! Postgres-backed store. `append` locks the row with `SELECT ... FOR UPDATE`
//! so same-id writers queue inside the database; the partial unique index on
//! active bargains backs the one-per-key rule in `create`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};

use super::{check_revision, BargainStore, Opened};
use crate::error::{BargainError, BargainResult};
use crate::models::{Bargain, BargainId, BargainStatus, NewBargain, Party, UnknownVariant};
use crate::negotiation::{self, Command, Effect, Transition};
use crate::schema::bargains;

const ACTIVE: [&str; 3] = ["pending", "accepted", "agreed"];

#[derive(Queryable, Selectable)]
#[diesel(table_name = bargains, check_for_backend(diesel::pg::Pg))]
struct BargainRow {
    id: i64,
    product_id: i64,
    product_name: String,
    supplier_id: i64,
    supplier_name: String,
    vendor_id: i64,
    vendor_name: String,
    original_price: f64,
    quantity: f64,
    unit: String,
    messages: serde_json::Value,
    status: String,
    vendor_accepted: bool,
    supplier_accepted: bool,
    accepted_by: Option<String>,
    vendor_deal_done: bool,
    supplier_deal_done: bool,
    final_price: Option<i64>,
    revision: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<BargainRow> for Bargain {
    type Error = BargainError;

    fn try_from(row: BargainRow) -> Result<Self, Self::Error> {
        let status: BargainStatus = row
            .status
            .parse()
            .map_err(|e: UnknownVariant| BargainError::Storage(e.to_string()))?;
        let accepted_by = row
            .accepted_by
            .as_deref()
            .map(str::parse::<Party>)
            .transpose()
            .map_err(|e| BargainError::Storage(e.to_string()))?;
        let messages = serde_json::from_value(row.messages)
            .map_err(|e| BargainError::Storage(format!("corrupt messages: {}", e)))?;
        Ok(Bargain {
            id: row.id,
            product_id: row.product_id,
            product_name: row.product_name,
            supplier_id: row.supplier_id,
            supplier_name: row.supplier_name,
            vendor_id: row.vendor_id,
            vendor_name: row.vendor_name,
            original_price: row.original_price,
            quantity: row.quantity,
            unit: row.unit,
            messages,
            status,
            vendor_accepted: row.vendor_accepted,
            supplier_accepted: row.supplier_accepted,
            accepted_by,
            vendor_deal_done: row.vendor_deal_done,
            supplier_deal_done: row.supplier_deal_done,
            final_price: row.final_price,
            revision: row.revision as u64,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = bargains)]
struct NewBargainRow {
    product_id: i64,
    product_name: String,
    supplier_id: i64,
    supplier_name: String,
    vendor_id: i64,
    vendor_name: String,
    original_price: f64,
    quantity: f64,
    unit: String,
    created_at: DateTime<Utc>,
}

impl From<NewBargain> for NewBargainRow {
    fn from(ctx: NewBargain) -> Self {
        Self {
            product_id: ctx.product_id,
            product_name: ctx.product_name,
            supplier_id: ctx.supplier_id,
            supplier_name: ctx.supplier_name,
            vendor_id: ctx.vendor_id,
            vendor_name: ctx.vendor_name,
            original_price: ctx.original_price,
            quantity: ctx.quantity,
            unit: ctx.unit,
            created_at: Utc::now(),
        }
    }
}

/// The mutable part of a record. Identity and reference values are never written back.
#[derive(AsChangeset)]
#[diesel(table_name = bargains, treat_none_as_null = true)]
struct BargainChanges {
    messages: serde_json::Value,
    status: String,
    vendor_accepted: bool,
    supplier_accepted: bool,
    accepted_by: Option<String>,
    vendor_deal_done: bool,
    supplier_deal_done: bool,
    final_price: Option<i64>,
    revision: i64,
}

impl TryFrom<&Bargain> for BargainChanges {
    type Error = BargainError;

    fn try_from(b: &Bargain) -> Result<Self, Self::Error> {
        Ok(Self {
            messages: serde_json::to_value(&b.messages)
                .map_err(|e| BargainError::Storage(e.to_string()))?,
            status: b.status.as_str().to_string(),
            vendor_accepted: b.vendor_accepted,
            supplier_accepted: b.supplier_accepted,
            accepted_by: b.accepted_by.map(|p| p.as_str().to_string()),
            vendor_deal_done: b.vendor_deal_done,
            supplier_deal_done: b.supplier_deal_done,
            final_price: b.final_price,
            revision: b.revision as i64,
        })
    }
}

/// Error type for diesel transactions, which must accept `diesel::result::Error`.
enum TxError {
    Db(DieselError),
    Bargain(BargainError),
}

impl From<DieselError> for TxError {
    fn from(e: DieselError) -> Self {
        TxError::Db(e)
    }
}

impl From<BargainError> for TxError {
    fn from(e: BargainError) -> Self {
        TxError::Bargain(e)
    }
}

impl From<TxError> for BargainError {
    fn from(e: TxError) -> Self {
        match e {
            TxError::Bargain(e) => e,
            TxError::Db(e) => BargainError::Storage(e.to_string()),
        }
    }
}

type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgBargainStore {
    pool: PgPool,
}

impl PgBargainStore {
    pub fn connect(database_url: &str, pool_size: u32) -> BargainResult<Self> {
        log::info!("Connecting bargain store to {}", database_url);
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(|e| {
                log::error!("Failed to establish database pool: {}", e);
                BargainError::Storage(e.to_string())
            })?;
        Ok(Self { pool })
    }

    /// Diesel is blocking; run each unit of work on the blocking pool.
    async fn run<T, F>(&self, work: F) -> BargainResult<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T, TxError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| BargainError::Storage(e.to_string()))?;
            work(&mut conn).map_err(BargainError::from)
        })
        .await
        .map_err(|e| BargainError::Storage(e.to_string()))?
    }
}

fn find_active(conn: &mut PgConnection, ctx: &NewBargain) -> Result<Option<Bargain>, TxError> {
    let row = bargains::table
        .filter(bargains::product_id.eq(ctx.product_id))
        .filter(bargains::vendor_id.eq(ctx.vendor_id))
        .filter(bargains::supplier_id.eq(ctx.supplier_id))
        .filter(bargains::status.eq_any(ACTIVE))
        .select(BargainRow::as_select())
        .first(conn)
        .optional()?;
    Ok(row.map(Bargain::try_from).transpose()?)
}

fn into_bargains(rows: Vec<BargainRow>) -> Result<Vec<Bargain>, TxError> {
    rows.into_iter()
        .map(|row| Bargain::try_from(row).map_err(TxError::from))
        .collect()
}

#[async_trait]
impl BargainStore for PgBargainStore {
    async fn create(&self, ctx: NewBargain) -> BargainResult<Opened> {
        self.run(move |conn| {
            let attempt = conn.transaction::<_, TxError, _>(|conn| {
                if let Some(bargain) = find_active(conn, &ctx)? {
                    return Ok(Opened { bargain, created: false });
                }
                let row = diesel::insert_into(bargains::table)
                    .values(NewBargainRow::from(ctx.clone()))
                    .returning(BargainRow::as_returning())
                    .get_result(conn)?;
                Ok(Opened {
                    bargain: Bargain::try_from(row)?,
                    created: true,
                })
            });
            match attempt {
                // Lost the race against another opener; theirs is the active one.
                Err(TxError::Db(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _))) => {
                    let bargain = find_active(conn, &ctx)?.ok_or_else(|| {
                        BargainError::Storage("active bargain vanished after conflict".into())
                    })?;
                    Ok(Opened { bargain, created: false })
                }
                other => other,
            }
        })
        .await
        .map(|opened| {
            log::info!(
                "{} bargain {} for product {}",
                if opened.created { "Created" } else { "Reusing" },
                opened.bargain.id,
                opened.bargain.product_id
            );
            opened
        })
    }

    async fn get(&self, id: BargainId) -> BargainResult<Bargain> {
        self.run(move |conn| {
            let row = bargains::table
                .find(id)
                .select(BargainRow::as_select())
                .get_result(conn)
                .optional()?
                .ok_or(BargainError::NotFound(id))?;
            Ok(Bargain::try_from(row)?)
        })
        .await
    }

    async fn append(
        &self,
        id: BargainId,
        command: Command,
        expected_revision: Option<u64>,
    ) -> BargainResult<Transition> {
        let name = command.name();
        let transition = self
            .run(move |conn| {
                conn.transaction::<_, TxError, _>(|conn| {
                    let row = bargains::table
                        .find(id)
                        .select(BargainRow::as_select())
                        .for_update()
                        .get_result(conn)
                        .optional()?
                        .ok_or(BargainError::NotFound(id))?;
                    let current = Bargain::try_from(row)?;
                    check_revision(&current, expected_revision)?;

                    let transition = negotiation::apply(&current, &command, Utc::now())?;
                    if transition.effect != Effect::Unchanged {
                        diesel::update(bargains::table.find(id))
                            .set(BargainChanges::try_from(&transition.bargain)?)
                            .execute(conn)?;
                    }
                    Ok(transition)
                })
            })
            .await?;
        log::debug!(
            "Bargain {} {} -> {:?} (revision {})",
            id,
            name,
            transition.effect,
            transition.bargain.revision
        );
        Ok(transition)
    }

    async fn list_by_supplier(&self, supplier_id: i64) -> BargainResult<Vec<Bargain>> {
        self.run(move |conn| {
            let rows = bargains::table
                .filter(bargains::supplier_id.eq(supplier_id))
                .order(bargains::id.asc())
                .select(BargainRow::as_select())
                .load(conn)?;
            into_bargains(rows)
        })
        .await
    }

    async fn list_by_vendor(&self, vendor_id: i64) -> BargainResult<Vec<Bargain>> {
        self.run(move |conn| {
            let rows = bargains::table
                .filter(bargains::vendor_id.eq(vendor_id))
                .order(bargains::id.asc())
                .select(BargainRow::as_select())
                .load(conn)?;
            into_bargains(rows)
        })
        .await
    }

    async fn delete(&self, id: BargainId) -> BargainResult<Bargain> {
        self.run(move |conn| {
            let row = diesel::delete(bargains::table.find(id))
                .returning(BargainRow::as_returning())
                .get_result(conn)
                .optional()?
                .ok_or(BargainError::NotFound(id))?;
            log::info!("Deleted bargain {}", id);
            Ok(Bargain::try_from(row)?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BargainMessage;

    fn agreed() -> Bargain {
        let mut b = Bargain::open(
            4,
            NewBargain {
                product_id: 10,
                product_name: "Organic Tomatoes".into(),
                supplier_id: 2,
                supplier_name: "Sakshi".into(),
                vendor_id: 1,
                vendor_name: "Manya".into(),
                original_price: 60.0,
                quantity: 25.0,
                unit: "kg".into(),
            },
            "2024-07-27T12:00:00Z".parse().unwrap(),
        );
        b.messages.push(BargainMessage {
            sender: Party::Vendor,
            message: "Can you do 50?".into(),
            offer: Some(50),
            timestamp: "2024-07-27T12:05:00Z".parse().unwrap(),
        });
        b.status = BargainStatus::Agreed;
        b.supplier_accepted = true;
        b.accepted_by = Some(Party::Supplier);
        b.vendor_deal_done = true;
        b.supplier_deal_done = true;
        b.final_price = Some(50);
        b.revision = 3;
        b
    }

    /// The row diesel would load after `BargainChanges` was written for `b`.
    fn stored(b: &Bargain) -> BargainRow {
        let changes = BargainChanges::try_from(b).unwrap();
        BargainRow {
            id: b.id,
            product_id: b.product_id,
            product_name: b.product_name.clone(),
            supplier_id: b.supplier_id,
            supplier_name: b.supplier_name.clone(),
            vendor_id: b.vendor_id,
            vendor_name: b.vendor_name.clone(),
            original_price: b.original_price,
            quantity: b.quantity,
            unit: b.unit.clone(),
            messages: changes.messages,
            status: changes.status,
            vendor_accepted: changes.vendor_accepted,
            supplier_accepted: changes.supplier_accepted,
            accepted_by: changes.accepted_by,
            vendor_deal_done: changes.vendor_deal_done,
            supplier_deal_done: changes.supplier_deal_done,
            final_price: changes.final_price,
            revision: changes.revision,
            created_at: b.created_at,
        }
    }

    #[test]
    fn test_row_conversion_keeps_the_record() {
        let b = agreed();
        let row = stored(&b);
        assert_eq!(row.status, "agreed");
        assert_eq!(row.accepted_by.as_deref(), Some("supplier"));
        assert_eq!(row.revision, 3);
        assert_eq!(Bargain::try_from(row).unwrap(), b);
    }

    #[test]
    fn test_open_bargain_has_null_acceptor() {
        let mut b = agreed();
        b.status = BargainStatus::Pending;
        b.accepted_by = None;
        b.final_price = None;
        let changes = BargainChanges::try_from(&b).unwrap();
        assert_eq!(changes.accepted_by, None);
        assert_eq!(changes.final_price, None);
    }

    #[test]
    fn test_unknown_status_is_a_storage_error() {
        let mut row = stored(&agreed());
        row.status = "haggling".into();
        let err = Bargain::try_from(row).unwrap_err();
        assert_eq!(err, BargainError::Storage("unknown status \"haggling\"".into()));
    }

    #[test]
    fn test_unknown_acceptor_is_a_storage_error() {
        let mut row = stored(&agreed());
        row.accepted_by = Some("broker".into());
        assert_eq!(
            Bargain::try_from(row).unwrap_err(),
            BargainError::Storage("unknown party \"broker\"".into())
        );
    }

    #[test]
    fn test_corrupt_messages_are_a_storage_error() {
        let mut row = stored(&agreed());
        row.messages = serde_json::json!({"not": "a list"});
        match Bargain::try_from(row) {
            Err(BargainError::Storage(msg)) => assert!(msg.starts_with("corrupt messages")),
            other => panic!("expected a storage error, got {:?}", other),
        }
    }

    #[test]
    fn test_active_filter_matches_status_rule() {
        for status in BargainStatus::ALL {
            assert_eq!(ACTIVE.contains(&status.as_str()), status.is_active(), "{}", status);
        }
    }
}
