// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// A held position for a single symbol, as reported by the broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub total_qty: f64,
    pub free_qty: f64,
    /// The exchange does not expose average cost, so callers default this to
    /// the current price. See DESIGN.md's Open Question on avg_cost.
    pub avg_cost: f64,
}

/// Balances and open positions for one account, as returned by the broker
/// adapter's `get_balance_and_positions` operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub positions: Vec<PositionInfo>,
}

/// The four operations an oracle decision may specify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Buy,
    Sell,
    Hold,
    Close,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
            Self::Close => write!(f, "close"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "hold" => Ok(Self::Hold),
            "close" => Ok(Self::Close),
            _ => Err(()),
        }
    }
}

/// The three trigger modes a strategy config may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Realtime,
    Interval,
    TickBatch,
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::Interval
    }
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Interval => write!(f, "interval"),
            Self::TickBatch => write!(f, "tick_batch"),
        }
    }
}

/// The two order types a broker adapter's `execute_order` may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Unique identifier for an account (the SQLite rowid). A newtype so callers
/// cannot accidentally mix account ids with other integer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
