use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cryptobot_core::{DataProvider, EventMeta, MarketEvent};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

pub const SOURCE: &str = "CsvReplay";

/// Historical bars replayed as market ticks at their close price.
///
/// Expected columns: `timestamp,symbol,open,high,low,close,volume` with a
/// header row.
pub struct CsvReplay {
    events: VecDeque<MarketEvent>,
}

impl CsvReplay {
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or a row is malformed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
        Self::from_csv(reader)
    }

    /// # Errors
    ///
    /// Returns error if a row is malformed.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Self::from_csv(csv::Reader::from_reader(reader))
    }

    fn from_csv<R: Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let mut events = Vec::new();

        for (line, result) in reader.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read CSV row {}", line + 1))?;
            anyhow::ensure!(
                record.len() >= 7,
                "CSV row {} has {} columns, expected 7",
                line + 1,
                record.len()
            );
            let timestamp: DateTime<Utc> = record[0]
                .parse()
                .with_context(|| format!("Invalid timestamp on row {}", line + 1))?;
            let decimal = |i: usize| {
                Decimal::from_str(&record[i])
                    .with_context(|| format!("Invalid number in column {} on row {}", i, line + 1))
            };
            let (open, high, low, close, volume) =
                (decimal(2)?, decimal(3)?, decimal(4)?, decimal(5)?, decimal(6)?);

            let mut event = MarketEvent::tick(
                EventMeta::new(Uuid::new_v4(), timestamp, SOURCE),
                &record[1],
                close,
                volume,
            );
            event.klines.insert(
                "bar".to_string(),
                json!({
                    "open": open.to_string(),
                    "high": high.to_string(),
                    "low": low.to_string(),
                    "close": close.to_string(),
                }),
            );
            events.push(event);
        }

        events.sort_by_key(|e| e.meta.timestamp);

        Ok(Self {
            events: events.into(),
        })
    }

    /// Distinct symbols in order of first appearance.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for event in &self.events {
            if !symbols.contains(&event.symbol) {
                symbols.push(event.symbol.clone());
            }
        }
        symbols
    }

    /// Timestamp of the earliest bar.
    #[must_use]
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.events.front().map(|e| e.meta.timestamp)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl DataProvider for CsvReplay {
    async fn next_event(&mut self) -> Result<Option<MarketEvent>> {
        Ok(self.events.pop_front())
    }
}
