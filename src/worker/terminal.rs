//! Vendor terminal boundary
//!
//! The worker drives the terminal through [`TerminalApi`]; everything above
//! this trait is backend-agnostic. Error codes follow the vendor library's
//! `last_error` convention so messages read the same whichever backend
//! produced them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A vendor-level failure: numeric code plus message, passed through verbatim
#[derive(Debug, Clone, Error)]
#[error("({code}) {message}")]
pub struct TerminalError {
    pub code: i32,
    pub message: String,
}

impl TerminalError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMETER, message)
    }

    pub fn not_connected() -> Self {
        Self::new(codes::NOT_CONNECTED, describe(codes::NOT_CONNECTED))
    }
}

/// Vendor error codes as reported by `last_error`
pub mod codes {
    pub const IPC_TIMEOUT: i32 = -10005;
    pub const IPC_INIT_FAILED: i32 = -10004;
    pub const STARTUP_PATH_NOT_FOUND: i32 = -9999;
    pub const INSUFFICIENT_BUFFER: i32 = -8;
    pub const STRUCTURE_TOO_SMALL: i32 = -7;
    pub const AUTH_FAILED: i32 = -6;
    pub const INTERNAL_ERROR: i32 = -5;
    pub const INSUFFICIENT_MEMORY: i32 = -4;
    pub const INVALID_PARAMETER: i32 = -3;
    pub const NOT_CONNECTED: i32 = -2;
    pub const UNKNOWN_ERROR: i32 = -1;
    pub const OK: i32 = 0;
}

/// Human-readable explanation for a vendor error code
pub fn describe(code: i32) -> &'static str {
    match code {
        codes::IPC_TIMEOUT => "IPC timeout while talking to the terminal",
        codes::IPC_INIT_FAILED => "IPC initialization failed",
        codes::STARTUP_PATH_NOT_FOUND => "terminal executable path not found",
        codes::INSUFFICIENT_BUFFER => "receive buffer too small",
        codes::STRUCTURE_TOO_SMALL => "data structure too small",
        codes::AUTH_FAILED => "authorization failed",
        codes::INTERNAL_ERROR => "terminal internal error",
        codes::INSUFFICIENT_MEMORY => "insufficient memory",
        codes::INVALID_PARAMETER => "invalid parameter",
        codes::NOT_CONNECTED => "no connection to the terminal",
        codes::UNKNOWN_ERROR => "unknown error",
        codes::OK => "no error",
        _ => "unrecognized error code",
    }
}

/// Everything `initialize` needs; the password lives here only for the call
pub struct TerminalInit {
    pub exe_path: PathBuf,
    pub data_dir: PathBuf,
    pub login: i64,
    pub password: String,
    pub server: String,
    pub timeout: Duration,
}

/// One quote: bid/ask/last with an epoch-seconds timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    pub time: i64,
}

/// One OHLC bar with an epoch-seconds open time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub tick_volume: i64,
}

/// Chart timeframes the candle API accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "M1" => Some(Self::M1),
            "M5" => Some(Self::M5),
            "M15" => Some(Self::M15),
            "M30" => Some(Self::M30),
            "H1" => Some(Self::H1),
            "H4" => Some(Self::H4),
            "D1" => Some(Self::D1),
            "W1" => Some(Self::W1),
            "MN1" => Some(Self::MN1),
            _ => None,
        }
    }

    /// Bar width in seconds
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
            Self::W1 => 604_800,
            Self::MN1 => 2_592_000,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
            Self::W1 => "W1",
            Self::MN1 => "MN1",
        };
        f.write_str(s)
    }
}

/// The in-process vendor surface a worker drives
///
/// Implementations are not thread-safe and must only ever be touched from
/// the worker's single thread.
pub trait TerminalApi {
    /// Connect to the terminal and authenticate; must be called first
    fn initialize(&mut self, init: &TerminalInit) -> Result<(), TerminalError>;

    /// Release the terminal connection; called exactly once on loop exit
    fn shutdown(&mut self);

    /// Pid of the terminal process launched during `initialize`, if known
    fn terminal_pid(&self) -> Option<u32>;

    fn version(&self) -> Result<Value, TerminalError>;

    fn account_info(&self) -> Result<Value, TerminalError>;

    fn quote(&self, symbol: &str) -> Result<Tick, TerminalError>;

    fn symbol_info(&self, symbol: &str) -> Result<Value, TerminalError>;

    fn symbol_select(&mut self, symbol: &str, enable: bool) -> Result<(), TerminalError>;

    fn symbols_total(&self) -> Result<usize, TerminalError>;

    fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<Candle>, TerminalError>;

    fn positions_get(&self, symbol: Option<&str>) -> Result<Vec<Value>, TerminalError>;

    fn order_send(&mut self, request: &Value) -> Result<Value, TerminalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_code_and_message() {
        let err = TerminalError::new(codes::AUTH_FAILED, "invalid account");
        assert_eq!(err.to_string(), "(-6) invalid account");
    }

    #[test]
    fn test_describe_known_codes() {
        assert_eq!(describe(codes::STARTUP_PATH_NOT_FOUND), "terminal executable path not found");
        assert_eq!(describe(codes::OK), "no error");
        assert_eq!(describe(12345), "unrecognized error code");
    }

    #[test]
    fn test_timeframe_parse_and_seconds() {
        assert_eq!(Timeframe::parse("m5"), Some(Timeframe::M5));
        assert_eq!(Timeframe::parse("H4"), Some(Timeframe::H4));
        assert_eq!(Timeframe::parse("H2"), None);
        assert_eq!(Timeframe::M1.seconds(), 60);
        assert_eq!(Timeframe::D1.seconds(), 86_400);
        assert_eq!(Timeframe::H1.to_string(), "H1");
    }
}
