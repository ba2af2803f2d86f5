//! SQLite persistence for the position manager.
//!
//! Keeps what a restart needs and what an operator audits:
//! - The settings record (owner, roles, referrer code, cap)
//! - A journal of every `PositionChanged` event the manager caused

use crate::ledger::{Address, PositionChanged, ReferrerCode};
use crate::lemma::LemmaSettings;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Journaled position change with the operation that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub id: i64,
    /// `open`, `close` or `rebalance`
    pub operation: String,
    pub event: PositionChanged,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Create a new persistence manager, initializing the database if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Settings record (singleton row)
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                owner TEXT NOT NULL,
                usd_issuer TEXT NOT NULL,
                rebalancer TEXT,
                referrer_code TEXT NOT NULL,
                max_position TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- PositionChanged journal
            CREATE TABLE IF NOT EXISTS position_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation TEXT NOT NULL,
                trader TEXT NOT NULL,
                base_token TEXT NOT NULL,
                exchanged_base TEXT NOT NULL,
                exchanged_quote TEXT NOT NULL,
                fee TEXT NOT NULL,
                open_notional TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                delta_base_balance TEXT NOT NULL,
                price_after TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_position_events_timestamp ON position_events(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Upsert the settings record.
    pub fn save_settings(&self, settings: &LemmaSettings) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO settings (id, owner, usd_issuer, rebalancer, referrer_code, max_position, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                owner = ?1,
                usd_issuer = ?2,
                rebalancer = ?3,
                referrer_code = ?4,
                max_position = ?5,
                updated_at = ?6
            "#,
            params![
                settings.owner.to_string(),
                settings.usd_issuer.to_string(),
                settings.rebalancer.map(|r| r.to_string()),
                hex::encode(settings.referrer_code.as_bytes()),
                settings.max_position.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(owner = %settings.owner, "Settings saved");
        Ok(())
    }

    pub fn load_settings(&self) -> Result<Option<LemmaSettings>> {
        let row = self
            .conn
            .query_row(
                "SELECT owner, usd_issuer, rebalancer, referrer_code, max_position FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((owner, usd_issuer, rebalancer, referrer_code, max_position)) = row else {
            return Ok(None);
        };

        let rebalancer = rebalancer
            .map(|r| parse_address(&r))
            .transpose()
            .context("Invalid rebalancer in settings")?;

        Ok(Some(LemmaSettings {
            owner: parse_address(&owner).context("Invalid owner in settings")?,
            usd_issuer: parse_address(&usd_issuer).context("Invalid usd issuer in settings")?,
            rebalancer,
            referrer_code: parse_referrer_code(&referrer_code)?,
            max_position: Decimal::from_str(&max_position)
                .context("Invalid max position in settings")?,
        }))
    }

    /// Append a position change to the journal.
    pub fn record_event(&self, operation: &str, event: &PositionChanged) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO position_events (operation, trader, base_token, exchanged_base,
                                         exchanged_quote, fee, open_notional, realized_pnl,
                                         delta_base_balance, price_after, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                operation,
                event.trader.to_string(),
                event.base_token.to_string(),
                event.exchanged_base.to_string(),
                event.exchanged_quote.to_string(),
                event.fee.to_string(),
                event.open_notional.to_string(),
                event.realized_pnl.to_string(),
                event.delta_base_balance.to_string(),
                event.price_after.to_string(),
                event.timestamp.to_rfc3339(),
            ],
        )?;
        debug!(operation, exchanged_base = %event.exchanged_base, "Position event journaled");
        Ok(())
    }

    /// Journal entries, oldest first.
    pub fn events(&self) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, operation, trader, base_token, exchanged_base, exchanged_quote, fee,
                   open_notional, realized_pnl, delta_base_balance, price_after, timestamp
            FROM position_events
            ORDER BY id
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                let mut text = Vec::with_capacity(11);
                for idx in 1..12 {
                    text.push(row.get::<_, String>(idx)?);
                }
                Ok((row.get::<_, i64>(0)?, text))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, text)| {
                let decimal = |idx: usize| {
                    Decimal::from_str(&text[idx])
                        .with_context(|| format!("Invalid decimal in journal entry {id}"))
                };
                Ok(JournalEntry {
                    id,
                    operation: text[0].clone(),
                    event: PositionChanged {
                        trader: parse_address(&text[1])?,
                        base_token: parse_address(&text[2])?,
                        exchanged_base: decimal(3)?,
                        exchanged_quote: decimal(4)?,
                        fee: decimal(5)?,
                        open_notional: decimal(6)?,
                        realized_pnl: decimal(7)?,
                        delta_base_balance: decimal(8)?,
                        price_after: decimal(9)?,
                        timestamp: DateTime::parse_from_rfc3339(&text[10])
                            .map(|dt| dt.with_timezone(&Utc))
                            .with_context(|| format!("Invalid timestamp in journal entry {id}"))?,
                    },
                })
            })
            .collect()
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM position_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Clear all data (for testing or reset).
    pub fn clear_all(&self) -> Result<()> {
        warn!("Clearing all persistence data");
        self.conn.execute_batch(
            r#"
            DELETE FROM settings;
            DELETE FROM position_events;
            "#,
        )?;
        Ok(())
    }
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value).map_err(|e| anyhow::anyhow!("invalid address {value}: {e}"))
}

fn parse_referrer_code(value: &str) -> Result<ReferrerCode> {
    let bytes = hex::decode(value).context("Referrer code is not hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("referrer code must be 32 bytes"))?;
    Ok(ReferrerCode::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_event(exchanged_base: Decimal) -> PositionChanged {
        PositionChanged {
            trader: Address::from_label("perp_lemma"),
            base_token: Address::from_label("vETH"),
            exchanged_base,
            exchanged_quote: dec!(100),
            fee: dec!(0.1001),
            open_notional: dec!(100),
            realized_pnl: Decimal::ZERO,
            delta_base_balance: exchanged_base,
            price_after: dec!(99.98),
            timestamp: DateTime::parse_from_rfc3339("2026-10-18T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn test_settings_round_trip() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        assert!(manager.load_settings().unwrap().is_none());

        let mut settings = LemmaSettings::new(
            Address::from_label("owner"),
            Address::from_label("usd_lemma"),
        );
        settings.rebalancer = Some(Address::from_label("rebalancer"));
        settings.referrer_code = "Hello World".parse().unwrap();
        settings.max_position = dec!(1);
        manager.save_settings(&settings).unwrap();

        assert_eq!(manager.load_settings().unwrap(), Some(settings.clone()));

        settings.max_position = Decimal::MAX;
        settings.rebalancer = None;
        manager.save_settings(&settings).unwrap();
        assert_eq!(manager.load_settings().unwrap(), Some(settings));
    }

    #[test]
    fn test_journal_keeps_order() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        let opened = sample_event(dec!(-1.001001001001001001));
        let closed = sample_event(dec!(0.5));

        manager.record_event("open", &opened).unwrap();
        manager.record_event("close", &closed).unwrap();

        let entries = manager.events().unwrap();
        assert_eq!(manager.event_count().unwrap(), 2);
        assert_eq!(entries[0].operation, "open");
        assert_eq!(entries[0].event, opened);
        assert_eq!(entries[1].event.exchanged_base, dec!(0.5));
    }

    #[test]
    fn test_clear_all() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.record_event("open", &sample_event(dec!(-1))).unwrap();
        manager.clear_all().unwrap();
        assert_eq!(manager.event_count().unwrap(), 0);
    }
}
