//! Command dispatch
//!
//! Maps one request envelope onto one vendor call and always produces
//! exactly one response. Unknown commands, bad parameters, and vendor
//! failures all come back as `success:false`; nothing here panics or
//! escapes the loop.

use serde::Deserialize;
use serde_json::{json, Value};

use super::terminal::{TerminalApi, Timeframe};
use crate::protocol::{CommandRequest, CommandResponse};

#[derive(Deserialize)]
struct SymbolParams {
    symbol: String,
}

#[derive(Deserialize)]
struct SymbolSelectParams {
    symbol: String,
    #[serde(default = "default_enable")]
    enable: bool,
}

fn default_enable() -> bool {
    true
}

#[derive(Deserialize)]
struct CandlesParams {
    symbol: String,
    timeframe: String,
    #[serde(default = "default_count")]
    count: usize,
    #[serde(default)]
    start_time: Option<i64>,
}

fn default_count() -> usize {
    100
}

#[derive(Deserialize, Default)]
struct PositionsParams {
    #[serde(default)]
    symbol: Option<String>,
}

/// Execute one request against the terminal
pub fn dispatch(terminal: &mut dyn TerminalApi, request: &CommandRequest) -> CommandResponse {
    let command = request.command.as_str();
    let params = request.params_object();

    let outcome = match command {
        // No-op used by callers to refresh a session's idle clock
        "ping" => Ok(Value::Null),

        "version" => terminal.version().map_err(|e| e.to_string()),

        "account_info" => terminal.account_info().map_err(|e| e.to_string()),

        "quote" => parse(params).and_then(|p: SymbolParams| {
            terminal
                .quote(&p.symbol)
                .map(|t| json!({ "bid": t.bid, "ask": t.ask, "time": t.time }))
                .map_err(|e| e.to_string())
        }),

        "symbol_info_tick" => parse(params).and_then(|p: SymbolParams| {
            terminal
                .quote(&p.symbol)
                .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
                .map_err(|e| e.to_string())
        }),

        "symbol_info" => parse(params).and_then(|p: SymbolParams| {
            terminal.symbol_info(&p.symbol).map_err(|e| e.to_string())
        }),

        "symbol_select" => parse(params).and_then(|p: SymbolSelectParams| {
            terminal
                .symbol_select(&p.symbol, p.enable)
                .map(|_| Value::Null)
                .map_err(|e| e.to_string())
        }),

        "symbols_total" => terminal
            .symbols_total()
            .map(|n| json!(n))
            .map_err(|e| e.to_string()),

        "candles" => parse(params).and_then(|p: CandlesParams| {
            let timeframe = Timeframe::parse(&p.timeframe)
                .ok_or_else(|| format!("invalid timeframe: {}", p.timeframe))?;
            terminal
                .candles(&p.symbol, timeframe, p.count, p.start_time)
                .map(|bars| serde_json::to_value(bars).unwrap_or(Value::Null))
                .map_err(|e| e.to_string())
        }),

        "positions_get" => parse(params).and_then(|p: PositionsParams| {
            terminal
                .positions_get(p.symbol.as_deref())
                .map(|positions| Value::Array(positions))
                .map_err(|e| e.to_string())
        }),

        "order_send" => terminal.order_send(&params).map_err(|e| e.to_string()),

        _ => Err(format!("unknown command: {command}")),
    };

    match outcome {
        Ok(result) => CommandResponse::ok(command, result),
        Err(error) => CommandResponse::err(command, error),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}
