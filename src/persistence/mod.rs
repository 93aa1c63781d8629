//! Order ledger and audit persistence.
//!
//! The broker core only talks to the [`OrderLedger`] and [`AuditSink`] traits.
//! Two implementations ship with the crate:
//! - [`SqliteStore`]: durable, schema created on open
//! - [`MemoryStore`]: in-process, for tests and dry runs

use crate::account::StockPosition;
use crate::error::{BrokerError, Result};
use crate::orders::{LedgerOrder, OrderSide, OrderStatus, OrderType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub detail: Value,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        status: impl Into<String>,
        detail: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            detail,
            status: status.into(),
            timestamp,
        }
    }
}

/// Local record of every order the client submitted.
#[cfg_attr(test, mockall::automock)]
pub trait OrderLedger: Send + Sync {
    /// Insert or replace by local id.
    fn upsert(&self, order: &LedgerOrder) -> Result<()>;

    fn get(&self, local_id: Uuid) -> Result<Option<LedgerOrder>>;

    fn find_by_upstream_id(&self, upstream_id: &str) -> Result<Option<LedgerOrder>>;

    /// Orders not yet in a terminal status, oldest first.
    fn open_orders(&self) -> Result<Vec<LedgerOrder>>;
}

/// Destination for audit events.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Write an audit event; failures are logged, never surfaced to the caller.
pub fn audit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        warn!(event_type = %event.event_type, error = %e, "Failed to record audit event");
    }
}

/// SQLite-backed ledger and audit log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BrokerError::Storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("Order ledger initialized at {:?}", path);
        Ok(store)
    }

    /// In-memory database.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            -- Order ledger
            CREATE TABLE IF NOT EXISTS orders (
                local_id TEXT PRIMARY KEY,
                upstream_id TEXT,
                symbol TEXT NOT NULL,
                conid INTEGER,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT,
                stop_price TEXT,
                status TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                filled_at TEXT,
                cancelled_at TEXT,
                parent_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_upstream ON orders(upstream_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            -- Audit trail
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp);

            -- Stock holdings last seen by assignment detection
            CREATE TABLE IF NOT EXISTS stock_baseline (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holdings TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Replace the stored stock baseline used between CLI runs.
    pub fn save_stock_baseline(&self, holdings: &[StockPosition], at: DateTime<Utc>) -> Result<()> {
        let json = serde_json::to_string(holdings)?;
        self.conn.lock().execute(
            r#"
            INSERT INTO stock_baseline (id, holdings, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET holdings = excluded.holdings, updated_at = excluded.updated_at
            "#,
            params![json, at.to_rfc3339()],
        )?;
        debug!(holdings = holdings.len(), "Stock baseline saved");
        Ok(())
    }

    /// `None` when no baseline was ever saved, as opposed to an empty one.
    pub fn load_stock_baseline(&self) -> Result<Option<Vec<StockPosition>>> {
        let stored: Option<String> = self
            .conn
            .lock()
            .query_row("SELECT holdings FROM stock_baseline WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        stored
            .map(|json| serde_json::from_str(&json).map_err(BrokerError::from))
            .transpose()
    }

    /// Most recent audit events, newest first.
    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, event_type, status, detail
            FROM audit_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let events = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let detail: String = row.get(3)?;
                Ok(AuditEvent {
                    timestamp: parse_ts(&ts).unwrap_or_else(Utc::now),
                    event_type: row.get(1)?,
                    status: row.get(2)?,
                    detail: serde_json::from_str(&detail).unwrap_or(Value::String(detail)),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(events)
    }
}

const ORDER_COLUMNS: &str = "local_id, upstream_id, symbol, conid, side, quantity, order_type, \
     price, stop_price, status, submitted_at, filled_at, cancelled_at, parent_id";

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerOrder> {
    let bad = |idx: usize, what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid {what}").into(),
        )
    };

    let local_id: String = row.get(0)?;
    let side: String = row.get(4)?;
    let quantity: String = row.get(5)?;
    let order_type: String = row.get(6)?;
    let price: Option<String> = row.get(7)?;
    let stop_price: Option<String> = row.get(8)?;
    let status: String = row.get(9)?;
    let submitted_at: String = row.get(10)?;
    let filled_at: Option<String> = row.get(11)?;
    let cancelled_at: Option<String> = row.get(12)?;
    let parent_id: Option<String> = row.get(13)?;

    Ok(LedgerOrder {
        local_id: Uuid::parse_str(&local_id).map_err(|_| bad(0, "local id"))?,
        upstream_id: row.get(1)?,
        symbol: row.get(2)?,
        conid: row.get(3)?,
        side: OrderSide::parse(&side).ok_or_else(|| bad(4, "side"))?,
        quantity: Decimal::from_str(&quantity).unwrap_or_default(),
        order_type: OrderType::parse(&order_type).ok_or_else(|| bad(6, "order type"))?,
        price: price.and_then(|p| Decimal::from_str(&p).ok()),
        stop_price: stop_price.and_then(|p| Decimal::from_str(&p).ok()),
        status: OrderStatus::parse(&status).ok_or_else(|| bad(9, "status"))?,
        submitted_at: parse_ts(&submitted_at).unwrap_or_else(Utc::now),
        filled_at: filled_at.as_deref().and_then(parse_ts),
        cancelled_at: cancelled_at.as_deref().and_then(parse_ts),
        parent_id: parent_id.and_then(|p| Uuid::parse_str(&p).ok()),
    })
}

impl OrderLedger for SqliteStore {
    fn upsert(&self, order: &LedgerOrder) -> Result<()> {
        self.conn.lock().execute(
            &format!(
                "INSERT OR REPLACE INTO orders ({ORDER_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                order.local_id.to_string(),
                order.upstream_id,
                order.symbol,
                order.conid,
                order.side.as_str(),
                order.quantity.to_string(),
                order.order_type.as_str(),
                order.price.map(|p| p.to_string()),
                order.stop_price.map(|p| p.to_string()),
                order.status.as_str(),
                order.submitted_at.to_rfc3339(),
                order.filled_at.map(|t| t.to_rfc3339()),
                order.cancelled_at.map(|t| t.to_rfc3339()),
                order.parent_id.map(|p| p.to_string()),
            ],
        )?;

        debug!(
            local_id = %order.local_id,
            upstream_id = ?order.upstream_id,
            status = order.status.as_str(),
            "Ledger entry saved"
        );
        Ok(())
    }

    fn get(&self, local_id: Uuid) -> Result<Option<LedgerOrder>> {
        let conn = self.conn.lock();
        let order = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE local_id = ?1"),
                [local_id.to_string()],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    fn find_by_upstream_id(&self, upstream_id: &str) -> Result<Option<LedgerOrder>> {
        let conn = self.conn.lock();
        let order = conn
            .query_row(
                &format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE upstream_id = ?1 \
                     ORDER BY submitted_at DESC LIMIT 1"
                ),
                [upstream_id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    fn open_orders(&self) -> Result<Vec<LedgerOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE status NOT IN ('filled', 'cancelled', 'rejected') \
             ORDER BY submitted_at ASC"
        ))?;

        let orders = stmt
            .query_map([], order_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(orders)
    }
}

impl AuditSink for SqliteStore {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT INTO audit_events (timestamp, event_type, status, detail)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.status,
                event.detail.to_string(),
            ],
        )?;
        Ok(())
    }
}

/// In-memory ledger and audit log.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<Uuid, LedgerOrder>>,
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orders(&self) -> Vec<LedgerOrder> {
        let mut orders: Vec<LedgerOrder> = self.orders.lock().values().cloned().collect();
        orders.sort_by_key(|o| o.submitted_at);
        orders
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl OrderLedger for MemoryStore {
    fn upsert(&self, order: &LedgerOrder) -> Result<()> {
        self.orders.lock().insert(order.local_id, order.clone());
        Ok(())
    }

    fn get(&self, local_id: Uuid) -> Result<Option<LedgerOrder>> {
        Ok(self.orders.lock().get(&local_id).cloned())
    }

    fn find_by_upstream_id(&self, upstream_id: &str) -> Result<Option<LedgerOrder>> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| o.upstream_id.as_deref() == Some(upstream_id))
            .max_by_key(|o| o.submitted_at)
            .cloned())
    }

    fn open_orders(&self) -> Result<Vec<LedgerOrder>> {
        Ok(self
            .orders()
            .into_iter()
            .filter(|o| !o.status.is_terminal())
            .collect())
    }
}

impl AuditSink for MemoryStore {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
