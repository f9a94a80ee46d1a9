//! Snapshots of [`TradingState`] written through a [`Store`].
//!
//! A snapshot is one row in `trading_state_snapshots` plus one row per
//! position and order, written in a single transaction. Decimals are stored
//! as text so they round-trip exactly.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use cryptobot_core::{
    Order, Position, Row, SqlValue, StateSnapshot, Statement, Store, TradingState,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshots kept by [`StatePersistence::cleanup_old_snapshots`] by default.
pub const DEFAULT_KEEP_LAST: u32 = 100;

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS trading_state_snapshots (
        snapshot_id TEXT PRIMARY KEY,
        taken_at TEXT NOT NULL,
        trading_date TEXT NOT NULL,
        cash TEXT NOT NULL,
        equity TEXT NOT NULL,
        peak_equity TEXT NOT NULL,
        daily_start_equity TEXT NOT NULL,
        daily_pnl TEXT NOT NULL,
        trades_today INTEGER NOT NULL,
        trading_enabled INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trading_state_positions (
        snapshot_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity TEXT NOT NULL,
        entry_price TEXT NOT NULL,
        entry_time TEXT NOT NULL,
        stop_loss TEXT NOT NULL,
        take_profit TEXT NOT NULL,
        margin TEXT NOT NULL,
        entry_fee TEXT NOT NULL,
        unrealized_pnl TEXT NOT NULL,
        position_id TEXT
    )",
    "CREATE TABLE IF NOT EXISTS trading_state_orders (
        snapshot_id TEXT NOT NULL,
        client_order_id TEXT NOT NULL,
        exchange_order_id TEXT,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity TEXT NOT NULL,
        price TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        stop_loss TEXT NOT NULL,
        take_profit TEXT NOT NULL,
        rejection_reason TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_taken_at ON trading_state_snapshots (taken_at)",
    "CREATE INDEX IF NOT EXISTS idx_positions_snapshot ON trading_state_positions (snapshot_id)",
];

const LATEST: &str = "SELECT * FROM trading_state_snapshots ORDER BY taken_at DESC, rowid DESC LIMIT 1";

pub struct StatePersistence {
    store: Arc<dyn Store>,
}

impl StatePersistence {
    /// Wraps `store` and creates the schema, waiting for it to be written
    /// so the first read sees the tables.
    ///
    /// # Errors
    ///
    /// Returns error if the store is closed or the schema write times out.
    pub async fn new(store: Arc<dyn Store>) -> Result<Self> {
        for statement in SCHEMA {
            store
                .execute(statement, Vec::new())
                .await
                .context("Failed to queue state schema")?;
        }
        store
            .flush_writes(SCHEMA_TIMEOUT)
            .await
            .context("State schema was not written")?;
        Ok(Self { store })
    }

    /// Queues a snapshot of `state`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns error if the store refuses the writes.
    pub async fn save_state(&self, state: &TradingState) -> Result<Uuid> {
        self.save_snapshot(&state.snapshot()).await
    }

    /// Queues `snapshot` as one transaction, returning its id. A failed
    /// write leaves no partial snapshot behind.
    ///
    /// # Errors
    ///
    /// Returns error if the store refuses the writes.
    pub async fn save_snapshot(&self, snapshot: &StateSnapshot) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let key = id.to_string();
        let mut statements = Vec::with_capacity(1 + snapshot.positions.len() + snapshot.orders.len());

        statements.push(Statement::new(
            "INSERT INTO trading_state_snapshots (snapshot_id, taken_at, trading_date, cash, \
             equity, peak_equity, daily_start_equity, daily_pnl, trades_today, trading_enabled) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            vec![
                key.clone().into(),
                snapshot.taken_at.to_rfc3339().into(),
                snapshot.trading_date.to_string().into(),
                snapshot.cash.to_string().into(),
                snapshot.equity.to_string().into(),
                snapshot.peak_equity.to_string().into(),
                snapshot.daily_start_equity.to_string().into(),
                snapshot.daily_pnl.to_string().into(),
                i64::from(snapshot.trades_today).into(),
                i64::from(snapshot.trading_enabled).into(),
            ],
        ));

        for p in &snapshot.positions {
            statements.push(Statement::new(
                "INSERT INTO trading_state_positions (snapshot_id, symbol, side, quantity, \
                 entry_price, entry_time, stop_loss, take_profit, margin, entry_fee, \
                 unrealized_pnl, position_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                vec![
                    key.clone().into(),
                    p.symbol.clone().into(),
                    p.side.as_str().into(),
                    p.quantity.to_string().into(),
                    p.entry_price.to_string().into(),
                    p.entry_time.to_rfc3339().into(),
                    p.stop_loss.to_string().into(),
                    p.take_profit.to_string().into(),
                    p.margin.to_string().into(),
                    p.entry_fee.to_string().into(),
                    p.unrealized_pnl.to_string().into(),
                    p.position_id.clone().into(),
                ],
            ));
        }

        for o in &snapshot.orders {
            statements.push(Statement::new(
                "INSERT INTO trading_state_orders (snapshot_id, client_order_id, \
                 exchange_order_id, symbol, side, quantity, price, status, created_at, \
                 stop_loss, take_profit, rejection_reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                vec![
                    key.clone().into(),
                    o.client_order_id.clone().into(),
                    o.exchange_order_id.clone().into(),
                    o.symbol.clone().into(),
                    o.side.as_str().into(),
                    o.quantity.to_string().into(),
                    o.price.to_string().into(),
                    o.status.to_string().into(),
                    o.created_at.to_rfc3339().into(),
                    o.stop_loss.to_string().into(),
                    o.take_profit.to_string().into(),
                    o.rejection_reason.clone().into(),
                ],
            ));
        }

        self.store
            .execute_batch(statements)
            .await
            .context("Failed to queue snapshot")?;
        debug!(
            snapshot_id = %id,
            positions = snapshot.positions.len(),
            orders = snapshot.orders.len(),
            "Snapshot queued"
        );
        Ok(id)
    }

    /// Most recent snapshot, if any. Only sees writes that have been flushed.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored row is malformed.
    pub async fn load_latest(&self) -> Result<Option<StateSnapshot>> {
        let rows = self.store.query(LATEST, Vec::new()).await?;
        let Some(head) = rows.first() else {
            return Ok(None);
        };
        let key = text(head, "snapshot_id")?.to_string();

        let positions = self
            .store
            .query(
                "SELECT * FROM trading_state_positions WHERE snapshot_id = ?1 ORDER BY rowid",
                vec![key.clone().into()],
            )
            .await?
            .iter()
            .map(position_from_row)
            .collect::<Result<Vec<_>>>()?;

        let orders = self
            .store
            .query(
                "SELECT * FROM trading_state_orders WHERE snapshot_id = ?1 ORDER BY rowid",
                vec![key.into()],
            )
            .await?
            .iter()
            .map(order_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(StateSnapshot {
            taken_at: timestamp(head, "taken_at")?,
            trading_date: NaiveDate::from_str(text(head, "trading_date")?)
                .context("Malformed trading_date")?,
            cash: decimal(head, "cash")?,
            equity: decimal(head, "equity")?,
            peak_equity: decimal(head, "peak_equity")?,
            daily_start_equity: decimal(head, "daily_start_equity")?,
            daily_pnl: decimal(head, "daily_pnl")?,
            trades_today: u32::try_from(integer(head, "trades_today")?)
                .context("Malformed trades_today")?,
            trading_enabled: integer(head, "trading_enabled")? != 0,
            positions,
            orders,
        }))
    }

    /// Restores the latest snapshot into `state`. Returns `false` when
    /// nothing has been saved yet.
    ///
    /// # Errors
    ///
    /// Returns error if loading fails or the snapshot violates a ledger
    /// invariant.
    pub async fn restore_latest_state(&self, state: &TradingState) -> Result<bool> {
        let Some(snapshot) = self.load_latest().await? else {
            return Ok(false);
        };
        info!(
            taken_at = %snapshot.taken_at,
            positions = snapshot.positions.len(),
            cash = %snapshot.cash,
            "Restoring trading state"
        );
        state
            .restore(snapshot)
            .map_err(|e| anyhow!("Snapshot rejected by trading state: {e}"))?;
        Ok(true)
    }

    /// Queues deletion of all but the newest `keep_last_n` snapshots.
    ///
    /// # Errors
    ///
    /// Returns error if the store refuses the writes.
    pub async fn cleanup_old_snapshots(&self, keep_last_n: u32) -> Result<()> {
        let keep = "SELECT snapshot_id FROM trading_state_snapshots \
                    ORDER BY taken_at DESC, rowid DESC LIMIT ?1";
        let statements = ["trading_state_positions", "trading_state_orders", "trading_state_snapshots"]
            .into_iter()
            .map(|table| {
                Statement::new(
                    format!("DELETE FROM {table} WHERE snapshot_id NOT IN ({keep})"),
                    vec![i64::from(keep_last_n).into()],
                )
            })
            .collect();
        self.store
            .execute_batch(statements)
            .await
            .context("Failed to queue snapshot cleanup")?;
        debug!(keep_last_n, "Snapshot cleanup queued");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns error if the store does not flush within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.store
            .flush_writes(timeout)
            .await
            .context("Failed to flush snapshot writes")
    }

    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn snapshot_count(&self) -> Result<i64> {
        let rows = self
            .store
            .query("SELECT COUNT(*) AS n FROM trading_state_snapshots", Vec::new())
            .await?;
        rows.first()
            .map_or(Ok(0), |row| integer(row, "n"))
    }
}

fn value<'a>(row: &'a Row, column: &str) -> Result<&'a SqlValue> {
    row.get(column)
        .ok_or_else(|| anyhow!("Missing column {column}"))
}

fn text<'a>(row: &'a Row, column: &str) -> Result<&'a str> {
    value(row, column)?
        .as_str()
        .ok_or_else(|| anyhow!("Column {column} is not text"))
}

fn optional_text(row: &Row, column: &str) -> Result<Option<String>> {
    match value(row, column)? {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s.clone())),
        other => Err(anyhow!("Column {column} is not text: {other:?}")),
    }
}

fn integer(row: &Row, column: &str) -> Result<i64> {
    value(row, column)?
        .as_i64()
        .ok_or_else(|| anyhow!("Column {column} is not an integer"))
}

fn decimal(row: &Row, column: &str) -> Result<Decimal> {
    Decimal::from_str(text(row, column)?).with_context(|| format!("Malformed decimal in {column}"))
}

fn timestamp(row: &Row, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text(row, column)?)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Malformed timestamp in {column}"))
}

/// Parses a unit enum from the string its serde form uses.
fn label<T: DeserializeOwned>(row: &Row, column: &str) -> Result<T> {
    let raw = text(row, column)?;
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("Unknown value {raw:?} in {column}"))
}

fn position_from_row(row: &Row) -> Result<Position> {
    Ok(Position {
        symbol: text(row, "symbol")?.to_string(),
        side: label(row, "side")?,
        quantity: decimal(row, "quantity")?,
        entry_price: decimal(row, "entry_price")?,
        entry_time: timestamp(row, "entry_time")?,
        stop_loss: decimal(row, "stop_loss")?,
        take_profit: decimal(row, "take_profit")?,
        margin: decimal(row, "margin")?,
        entry_fee: decimal(row, "entry_fee")?,
        unrealized_pnl: decimal(row, "unrealized_pnl")?,
        position_id: optional_text(row, "position_id")?,
    })
}

fn order_from_row(row: &Row) -> Result<Order> {
    Ok(Order {
        client_order_id: text(row, "client_order_id")?.to_string(),
        exchange_order_id: optional_text(row, "exchange_order_id")?,
        symbol: text(row, "symbol")?.to_string(),
        side: label(row, "side")?,
        quantity: decimal(row, "quantity")?,
        price: decimal(row, "price")?,
        status: label(row, "status")?,
        created_at: timestamp(row, "created_at")?,
        stop_loss: decimal(row, "stop_loss")?,
        take_profit: decimal(row, "take_profit")?,
        rejection_reason: optional_text(row, "rejection_reason")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use cryptobot_core::{Clock, ManualClock, OrderStatus, Side};
    use rust_decimal_macros::dec;

    const WAIT: Duration = Duration::from_secs(5);

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    async fn persistence() -> StatePersistence {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        StatePersistence::new(store).await.unwrap()
    }

    fn populated(clock: Arc<ManualClock>) -> TradingState {
        let state = TradingState::new(dec!(10000), clock.clone());
        state.debit_cash(dec!(505)).unwrap();
        state
            .add_position(Position {
                symbol: "BTCUSDT".to_string(),
                side: Side::Buy,
                quantity: dec!(0.1),
                entry_price: dec!(50000),
                entry_time: clock.now(),
                stop_loss: dec!(49000),
                take_profit: dec!(51000),
                margin: dec!(500),
                entry_fee: dec!(5),
                unrealized_pnl: Decimal::ZERO,
                position_id: Some("ORD-1".to_string()),
            })
            .unwrap();
        state
            .add_order(
                Order::new(
                    "ORD-1".to_string(),
                    "BTCUSDT".to_string(),
                    Side::Buy,
                    dec!(0.1),
                    dec!(50000),
                    clock.now(),
                )
                .with_protection(dec!(49000), dec!(51000)),
            )
            .unwrap();
        state
            .add_order(Order::new(
                "ORD-2".to_string(),
                "ETHUSDT".to_string(),
                Side::Sell,
                dec!(1),
                dec!(3000),
                clock.now(),
            ))
            .unwrap();
        state
            .reject_order("ORD-2", OrderStatus::Rejected, "Insufficient cash")
            .unwrap();
        state
            .update_order_status("ORD-1", OrderStatus::Filled, Some("PAPER_ORD-1".to_string()))
            .unwrap();
        state
    }

    #[tokio::test]
    async fn test_save_and_restore_round_trip() {
        let clock = clock();
        let persistence = persistence().await;
        let state = populated(clock.clone());

        persistence.save_state(&state).await.unwrap();
        persistence.flush(WAIT).await.unwrap();

        let restored = TradingState::new(dec!(1), clock);
        assert!(persistence.restore_latest_state(&restored).await.unwrap());

        assert_eq!(restored.cash(), dec!(9495));
        let position = restored.position("BTCUSDT").unwrap();
        assert_eq!(position.entry_fee, dec!(5));
        assert_eq!(position.position_id.as_deref(), Some("ORD-1"));
        let order = restored.order("ORD-1").unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.exchange_order_id.as_deref(), Some("PAPER_ORD-1"));
        assert_eq!(order.stop_loss, dec!(49000));
        let rejected = restored.order("ORD-2").unwrap();
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Insufficient cash"));
    }

    #[tokio::test]
    async fn test_failed_position_write_leaves_previous_snapshot() {
        let clock = clock();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let persistence = StatePersistence::new(Arc::clone(&store)).await.unwrap();
        let state = populated(clock.clone());

        persistence.save_state(&state).await.unwrap();
        persistence.flush(WAIT).await.unwrap();

        store
            .execute(
                "CREATE TRIGGER reject_positions BEFORE INSERT ON trading_state_positions \
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END",
                Vec::new(),
            )
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(1));
        state.credit_cash(dec!(100)).unwrap();
        persistence.save_state(&state).await.unwrap();
        persistence.flush(WAIT).await.unwrap();

        assert_eq!(persistence.snapshot_count().await.unwrap(), 1);
        let latest = persistence.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.cash, dec!(9495));
        assert_eq!(latest.positions.len(), 1);
        assert_eq!(latest.orders.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_without_snapshot_is_noop() {
        let persistence = persistence().await;
        persistence.flush(WAIT).await.unwrap();
        let state = TradingState::new(dec!(10000), clock());

        assert!(!persistence.restore_latest_state(&state).await.unwrap());
        assert_eq!(state.cash(), dec!(10000));
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins_and_cleanup_keeps_newest() {
        let clock = clock();
        let persistence = persistence().await;
        let state = populated(clock.clone());

        for _ in 0..3 {
            persistence.save_state(&state).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }
        state.credit_cash(dec!(100)).unwrap();
        persistence.save_state(&state).await.unwrap();
        persistence.flush(WAIT).await.unwrap();

        let latest = persistence.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.cash, dec!(9595));

        persistence.cleanup_old_snapshots(2).await.unwrap();
        persistence.flush(WAIT).await.unwrap();
        assert_eq!(persistence.snapshot_count().await.unwrap(), 2);
        assert_eq!(
            persistence.load_latest().await.unwrap().unwrap().cash,
            dec!(9595)
        );
    }

    #[tokio::test]
    async fn test_default_retention_keeps_short_history() {
        let clock = clock();
        let persistence = persistence().await;
        let state = populated(clock.clone());

        for _ in 0..3 {
            persistence.save_state(&state).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }
        persistence.cleanup_old_snapshots(DEFAULT_KEEP_LAST).await.unwrap();
        persistence.flush(WAIT).await.unwrap();

        assert_eq!(DEFAULT_KEEP_LAST, 100);
        assert_eq!(persistence.snapshot_count().await.unwrap(), 3);
    }
}
