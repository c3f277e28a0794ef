// =============================================================================
// Typed error taxonomy
// =============================================================================
//
// Only the three outermost recover-and-continue loops (market stream poll,
// event-bus dispatch, trigger-engine refresh) catch arbitrary errors and log
// them. Everything below that returns one of these typed errors so callers
// can branch on what actually happened instead of matching strings.
// =============================================================================

use thiserror::Error;

/// Failures surfaced by the broker adapter (C1).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("account has no broker credentials configured")]
    CredentialMissing,
    #[error("broker rejected credentials (401)")]
    Unauthorized,
    #[error("broker denied access to this operation (403)")]
    Forbidden,
    #[error("broker blocked the request for geographic/compliance reasons")]
    GeoRestricted,
    #[error("broker rate limit exceeded")]
    RateLimited,
    #[error("network error talking to broker: {0}")]
    Network(String),
    #[error("broker returned a response we could not parse: {0}")]
    MalformedResponse(String),
    #[error("order notional {notional} is below the minimum {min_notional} for {symbol}")]
    NotionalBelowMin {
        symbol: String,
        notional: f64,
        min_notional: f64,
    },
    #[error("quantity for {symbol} cannot be adjusted to satisfy the lot/notional constraints")]
    LotSizeUnsatisfiable { symbol: String },
    #[error("symbol {0} is not recognized by the broker")]
    UnknownSymbol(String),
    #[error("broker rejected the order: {0}")]
    ExchangeRejected(String),
}

/// Failures surfaced by the oracle client (part of C5).
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("every configured oracle endpoint was exhausted without a usable reply")]
    AllEndpointsExhausted,
    #[error("transport error calling oracle: {0}")]
    Transport(String),
    #[error("oracle reply could not be parsed into any usable text")]
    MalformedReply,
}

/// A decision came back from the oracle but failed semantic validation
/// (unknown operation, unknown symbol, portion out of range). This is *not*
/// treated as a hard failure: the caller still writes a `DecisionLog` row
/// with `executed = false`.
#[derive(Debug, Error)]
#[error("oracle decision failed validation: {0}")]
pub struct DecisionError(pub String);

/// Failures surfaced by the persistence layer (L1).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record not found")]
    NotFound,
}

pub type BrokerResult<T> = Result<T, BrokerError>;
pub type OracleResult<T> = Result<T, OracleError>;
pub type StorageResult<T> = Result<T, StorageError>;
