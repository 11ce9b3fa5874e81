//! Core domain model for the market volatility warehouse.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mvw-core";

/// Relation names as they exist in the warehouse.
pub mod relation {
    pub const STAGING: &str = "staging";
    pub const DIM_INSTRUMENTO: &str = "dim_instrumento";
    pub const DIM_TEMPO: &str = "dim_tempo";
    pub const FACT_MOVIMENTACAO: &str = "fact_movimentacao_diaria";
    pub const VOLATILITY_WEEKLY: &str = "volatility_weekly";
}

/// One raw market observation as it lands in `staging`.
///
/// Column order matters: the bulk COPY statement and the source CSV both use
/// {date, symbol, open, high, low, close, volume}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub date: NaiveDate,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl MarketRecord {
    /// Render as a CSV data line in staging column order.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.date, self.symbol, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// One row of `fact_movimentacao_diaria` as read back from the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMovement {
    pub ticker: String,
    pub data_id: NaiveDate,
    pub close: f64,
    /// Day-over-day percent change; `None` for a ticker's first observed date
    /// or when the prior close was zero.
    pub variacao_diaria: Option<f64>,
}

/// Per-ticker mean weekly volatility, the reporter's query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityStat {
    pub ticker: String,
    pub avg_volatility: f64,
}

/// Fixed message emitted when `volatility_weekly` has no rows.
pub const NO_DATA_MESSAGE: &str = "No volatility data available for this run.";

/// Executive summary line for the most volatile ticker.
pub fn render_top_volatility(stat: &VolatilityStat) -> String {
    format!(
        "Ticker {} posted the highest mean weekly volatility ({:.2}%). Review hedge coverage and position limits.",
        stat.ticker, stat.avg_volatility
    )
}
