// =============================================================================
// Position Store — durable backing for the position table
// =============================================================================
//
// The CSV layout matches the operator-facing positions file: one row per
// position, append-only for opens, in-place status updates on close. Every
// rewrite goes through a tmp-file + rename so a crash mid-write can never
// leave a partially written table behind.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::positions::{Position, PositionStatus};
use crate::types::Side;

/// Storage seam for the position manager. Implementations must make `persist`
/// all-or-nothing: a reader never observes a half-written table.
pub trait PositionStore: Send + Sync {
    /// Load every persisted record (open and closed).
    fn load(&self) -> Result<Vec<Position>>;

    /// Replace the durable table with `positions`.
    fn persist(&self, positions: &[Position]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CSV row codec
// ---------------------------------------------------------------------------

/// On-disk row. All fields are strings so empty cells round-trip cleanly for
/// positions that have not closed yet.
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    #[serde(rename = "EntryTime")]
    entry_time: String,
    #[serde(rename = "Symbol")]
    symbol: String,
    #[serde(rename = "Side")]
    side: String,
    #[serde(rename = "Quantity")]
    quantity: String,
    #[serde(rename = "EntryPrice")]
    entry_price: String,
    #[serde(rename = "StopLossPrice")]
    stop_loss_price: String,
    #[serde(rename = "TakeProfitPrice")]
    take_profit_price: String,
    #[serde(rename = "CurrentPrice")]
    current_price: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitTime")]
    exit_time: String,
    #[serde(rename = "ExitPrice")]
    exit_price: String,
    #[serde(rename = "PnL")]
    pnl: String,
    #[serde(rename = "PnLPercent")]
    pnl_percent: String,
}

impl Row {
    fn from_position(pos: &Position) -> Self {
        Self {
            entry_time: pos.entry_time.to_rfc3339(),
            symbol: pos.symbol.clone(),
            side: pos.side.to_string(),
            // Quantity is fixed-point with 8 fractional digits.
            quantity: format!("{:.8}", pos.quantity),
            entry_price: pos.entry_price.to_string(),
            stop_loss_price: pos.stop_loss_price.to_string(),
            take_profit_price: pos.take_profit_price.to_string(),
            current_price: pos.current_price.to_string(),
            status: pos.status.to_string(),
            exit_time: pos
                .exit_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            exit_price: pos.exit_price.map(|p| p.to_string()).unwrap_or_default(),
            pnl: pos
                .realized_pnl
                .map(|p| format!("{p:.2}"))
                .unwrap_or_default(),
            pnl_percent: pos
                .realized_pnl_pct
                .map(|p| format!("{p:.2}%"))
                .unwrap_or_default(),
        }
    }

    fn into_position(self) -> Result<Position> {
        let entry_time: DateTime<Utc> = self
            .entry_time
            .parse()
            .with_context(|| format!("bad EntryTime '{}'", self.entry_time))?;
        let side: Side = self
            .side
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let status = match self.status.as_str() {
            "OPEN" => PositionStatus::Open,
            "CLOSED" => PositionStatus::Closed,
            other => anyhow::bail!("bad Status '{other}'"),
        };

        let parse_f64 = |name: &str, v: &str| -> Result<f64> {
            v.parse::<f64>()
                .with_context(|| format!("bad {name} '{v}'"))
        };
        let parse_opt_f64 = |name: &str, v: &str| -> Result<Option<f64>> {
            if v.is_empty() {
                Ok(None)
            } else {
                parse_f64(name, v).map(Some)
            }
        };

        let exit_time = if self.exit_time.is_empty() {
            None
        } else {
            Some(
                self.exit_time
                    .parse::<DateTime<Utc>>()
                    .with_context(|| format!("bad ExitTime '{}'", self.exit_time))?,
            )
        };

        Ok(Position {
            symbol: self.symbol,
            side,
            quantity: parse_f64("Quantity", &self.quantity)?,
            entry_price: parse_f64("EntryPrice", &self.entry_price)?,
            current_price: parse_f64("CurrentPrice", &self.current_price)?,
            stop_loss_price: parse_f64("StopLossPrice", &self.stop_loss_price)?,
            take_profit_price: parse_f64("TakeProfitPrice", &self.take_profit_price)?,
            status,
            entry_time,
            exit_time,
            exit_price: parse_opt_f64("ExitPrice", &self.exit_price)?,
            // The file does not carry the close reason; history reloaded from
            // disk reports it as unknown.
            exit_reason: None,
            realized_pnl: parse_opt_f64("PnL", &self.pnl)?,
            realized_pnl_pct: parse_opt_f64(
                "PnLPercent",
                self.pnl_percent.trim_end_matches('%'),
            )?,
        })
    }
}

// ---------------------------------------------------------------------------
// CsvStore
// ---------------------------------------------------------------------------

/// File-backed store with atomic rewrites.
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PositionStore for CsvStore {
    fn load(&self) -> Result<Vec<Position>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut positions = Vec::new();
        for row in reader.deserialize::<Row>() {
            let row = row.with_context(|| {
                format!("malformed row in {}", self.path.display())
            })?;
            positions.push(row.into_position()?);
        }

        debug!(path = %self.path.display(), count = positions.len(), "position table loaded");
        Ok(positions)
    }

    fn persist(&self, positions: &[Position]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        // Atomic rewrite: write a tmp sibling, then rename over the table.
        let tmp_path = self.path.with_extension("csv.tmp");

        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        for pos in positions {
            writer
                .serialize(Row::from_position(pos))
                .context("failed to serialize position row")?;
        }
        writer.flush().context("failed to flush position table")?;
        drop(writer);

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp table to {}", self.path.display()))?;

        debug!(path = %self.path.display(), count = positions.len(), "position table persisted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory store for tests and dry runs. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<Position>>,
}

impl PositionStore for MemoryStore {
    fn load(&self) -> Result<Vec<Position>> {
        Ok(self.records.read().clone())
    }

    fn persist(&self, positions: &[Position]) -> Result<()> {
        *self.records.write() = positions.to_vec();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::ExitReason;

    fn sample_open() -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity: 0.01,
            entry_price: 90_000.0,
            current_price: 90_000.0,
            stop_loss_price: 89_100.0,
            take_profit_price: 92_250.0,
            status: PositionStatus::Open,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
        }
    }

    fn sample_closed() -> Position {
        let mut pos = sample_open();
        pos.status = PositionStatus::Closed;
        pos.current_price = 89_000.0;
        pos.exit_time = Some(Utc::now());
        pos.exit_price = Some(89_000.0);
        pos.exit_reason = Some(ExitReason::StopLoss);
        pos.realized_pnl = Some(-10.0);
        pos.realized_pnl_pct = Some(-1.11);
        pos
    }

    fn tmp_store() -> (CsvStore, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "helios-positions-{}.csv",
            uuid::Uuid::new_v4()
        ));
        (CsvStore::new(&path), path)
    }

    #[test]
    fn load_missing_file_is_empty() {
        let (store, path) = tmp_store();
        assert!(store.load().unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn roundtrip_open_and_closed_rows() {
        let (store, path) = tmp_store();
        store.persist(&[sample_open(), sample_closed()]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);

        let open = &loaded[0];
        assert_eq!(open.symbol, "BTCUSDT");
        assert_eq!(open.side, Side::Buy);
        assert_eq!(open.status, PositionStatus::Open);
        assert!((open.quantity - 0.01).abs() < 1e-9);
        assert!((open.stop_loss_price - 89_100.0).abs() < 1e-9);
        assert!(open.exit_price.is_none());

        let closed = &loaded[1];
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_price, Some(89_000.0));
        assert_eq!(closed.realized_pnl, Some(-10.0));
        assert!((closed.realized_pnl_pct.unwrap() - (-1.11)).abs() < 1e-9);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn quantity_is_written_with_eight_decimals() {
        let (store, path) = tmp_store();
        store.persist(&[sample_open()]).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("0.01000000"), "raw table was: {raw}");
        assert!(raw.starts_with("EntryTime,Symbol,Side,Quantity,EntryPrice"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn persist_replaces_previous_table() {
        let (store, path) = tmp_store();
        store.persist(&[sample_open()]).unwrap();
        store.persist(&[sample_closed()]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, PositionStatus::Closed);
        // No stray tmp file left behind.
        assert!(!path.with_extension("csv.tmp").exists());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::default();
        store.persist(&[sample_open()]).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
