//! Deterministic terminal simulator
//!
//! The bundled backend behind [`TerminalApi`]. It validates the portable
//! installation and the credentials the way the vendor library does,
//! best-effort launches the data-dir terminal executable (reporting its pid
//! so the supervisor can reap it), and serves quotes, candles, and orders
//! from a model seeded per symbol. Identical inputs produce identical data
//! across runs, which makes session behavior reproducible end to end.
//!
//! Production deployments replace this whole worker with any executable that
//! speaks the same wire protocol against the real vendor library.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::terminal::{codes, Candle, TerminalApi, TerminalError, TerminalInit, Tick, Timeframe};

/// Instruments the simulated broker lists out of the box
const UNIVERSE: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD", "EURJPY", "GBPJPY",
    "EURGBP", "XAUUSD", "XAGUSD",
];

/// Vendor-style cap on a single candle pull
const MAX_CANDLES: usize = 5_000;

const TRADE_RETCODE_DONE: i64 = 10009;

#[derive(Debug, Clone)]
struct SimPosition {
    ticket: u64,
    symbol: String,
    volume: f64,
    side: i64,
    price_open: f64,
    time: i64,
}

/// Simulated vendor terminal; strictly single-threaded like the real library
pub struct SimTerminal {
    initialized: bool,
    login: i64,
    server: String,
    selected: BTreeSet<String>,
    positions: Vec<SimPosition>,
    next_ticket: u64,
    terminal_child: Option<Child>,
    terminal_pid: Option<u32>,
}

impl SimTerminal {
    pub fn new() -> Self {
        Self {
            initialized: false,
            login: 0,
            server: String::new(),
            selected: BTreeSet::new(),
            positions: Vec::new(),
            next_ticket: 1_000_000,
            terminal_child: None,
            terminal_pid: None,
        }
    }

    fn ensure_initialized(&self) -> Result<(), TerminalError> {
        if self.initialized {
            Ok(())
        } else {
            Err(TerminalError::not_connected())
        }
    }

    fn ensure_symbol(symbol: &str) -> Result<(), TerminalError> {
        if symbol.is_empty() {
            Err(TerminalError::invalid_parameter("symbol must not be empty"))
        } else {
            Ok(())
        }
    }

    /// Launch the data-dir terminal in portable mode, best-effort
    ///
    /// The real library starts the terminal itself; here we mirror that so
    /// the supervisor sees the same process topology. Failure to launch is
    /// not an initialization failure.
    fn launch_terminal(&mut self, exe_path: &Path, data_dir: &Path) {
        if !is_executable(exe_path) {
            debug!(exe = %exe_path.display(), "Terminal executable not runnable here, skipping launch");
            return;
        }

        match Command::new(exe_path)
            .current_dir(data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                let pid = child.id();
                info!(pid, exe = %exe_path.display(), "Terminal process launched");
                self.terminal_pid = Some(pid);
                self.terminal_child = Some(child);
            }
            Err(e) => {
                warn!(exe = %exe_path.display(), error = %e, "Failed to launch terminal process");
            }
        }
    }
}

impl Default for SimTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalApi for SimTerminal {
    fn initialize(&mut self, init: &TerminalInit) -> Result<(), TerminalError> {
        if !init.exe_path.is_file() {
            return Err(TerminalError::new(
                codes::STARTUP_PATH_NOT_FOUND,
                format!("terminal executable not found: {}", init.exe_path.display()),
            ));
        }

        if init.login <= 0 || init.password.is_empty() || init.server.is_empty() {
            return Err(TerminalError::new(codes::AUTH_FAILED, "invalid account"));
        }

        self.launch_terminal(&init.exe_path, &init.data_dir);

        self.login = init.login;
        self.server = init.server.clone();
        self.initialized = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.initialized = false;
        if let Some(mut child) = self.terminal_child.take() {
            let pid = child.id();
            debug!(pid, "Stopping terminal process");
            child.kill().ok();
            child.wait().ok();
        }
    }

    fn terminal_pid(&self) -> Option<u32> {
        self.terminal_pid
    }

    fn version(&self) -> Result<Value, TerminalError> {
        self.ensure_initialized()?;
        Ok(json!({ "version": "5.0.45", "build": 4500 }))
    }

    fn account_info(&self) -> Result<Value, TerminalError> {
        self.ensure_initialized()?;
        Ok(json!({
            "login": self.login,
            "server": self.server,
            "name": "Simulated Account",
            "currency": "USD",
            "leverage": 100,
            "balance": 10_000.0,
            "credit": 0.0,
            "equity": 10_000.0,
            "margin": 0.0,
            "margin_free": 10_000.0,
            "trade_allowed": true,
        }))
    }

    fn quote(&self, symbol: &str) -> Result<Tick, TerminalError> {
        self.ensure_initialized()?;
        Self::ensure_symbol(symbol)?;

        let mid = base_price(symbol);
        let spread = (mid * 1e-4).max(1e-5);
        Ok(Tick {
            bid: round5(mid),
            ask: round5(mid + spread),
            last: round5(mid),
            volume: 1 + (symbol_seed(symbol) % 500),
            time: epoch_now(),
        })
    }

    fn symbol_info(&self, symbol: &str) -> Result<Value, TerminalError> {
        self.ensure_initialized()?;
        Self::ensure_symbol(symbol)?;

        let tick = self.quote(symbol)?;
        Ok(json!({
            "symbol": symbol,
            "description": format!("{symbol} (simulated)"),
            "digits": 5,
            "point": 0.00001,
            "spread": ((tick.ask - tick.bid) / 0.00001).round() as i64,
            "bid": tick.bid,
            "ask": tick.ask,
            "volume_min": 0.01,
            "volume_max": 100.0,
            "trade_mode": 4,
            "selected": self.selected.contains(symbol),
        }))
    }

    fn symbol_select(&mut self, symbol: &str, enable: bool) -> Result<(), TerminalError> {
        self.ensure_initialized()?;
        Self::ensure_symbol(symbol)?;

        if enable {
            self.selected.insert(symbol.to_string());
        } else {
            self.selected.remove(symbol);
        }
        Ok(())
    }

    fn symbols_total(&self) -> Result<usize, TerminalError> {
        self.ensure_initialized()?;
        let extra = self
            .selected
            .iter()
            .filter(|s| !UNIVERSE.contains(&s.as_str()))
            .count();
        Ok(UNIVERSE.len() + extra)
    }

    fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
        start_time: Option<i64>,
    ) -> Result<Vec<Candle>, TerminalError> {
        self.ensure_initialized()?;
        Self::ensure_symbol(symbol)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let count = count.min(MAX_CANDLES);
        let step = timeframe.seconds();
        let end = start_time.unwrap_or_else(epoch_now);
        // Bars are aligned to the timeframe grid, newest last
        let last_open = end - end.rem_euclid(step);

        let mut rng = StdRng::seed_from_u64(symbol_seed(symbol) ^ (step as u64));
        let mut price = base_price(symbol);
        let mut bars = Vec::with_capacity(count);

        for i in (0..count).rev() {
            let open = price;
            let drift = price * rng.gen_range(-0.002..0.002);
            let close = (open + drift).max(1e-5);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.001));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.001));
            bars.push(Candle {
                time: last_open - (i as i64) * step,
                open: round5(open),
                high: round5(high),
                low: round5(low),
                close: round5(close),
                tick_volume: rng.gen_range(1..2_000),
            });
            price = close;
        }

        Ok(bars)
    }

    fn positions_get(&self, symbol: Option<&str>) -> Result<Vec<Value>, TerminalError> {
        self.ensure_initialized()?;
        Ok(self
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .map(|p| {
                json!({
                    "ticket": p.ticket,
                    "symbol": p.symbol,
                    "volume": p.volume,
                    "type": p.side,
                    "price_open": p.price_open,
                    "price_current": round5(base_price(&p.symbol)),
                    "time": p.time,
                    "profit": 0.0,
                })
            })
            .collect())
    }

    fn order_send(&mut self, request: &Value) -> Result<Value, TerminalError> {
        self.ensure_initialized()?;

        let symbol = request
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self::ensure_symbol(&symbol)?;

        let volume = request.get("volume").and_then(Value::as_f64).unwrap_or(0.0);
        if volume <= 0.0 {
            return Err(TerminalError::invalid_parameter("volume must be positive"));
        }

        let side = request.get("type").and_then(Value::as_i64).unwrap_or(0);
        let tick = self.quote(&symbol)?;
        let price = request
            .get("price")
            .and_then(Value::as_f64)
            .unwrap_or(if side == 0 { tick.ask } else { tick.bid });

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.positions.push(SimPosition {
            ticket,
            symbol: symbol.clone(),
            volume,
            side,
            price_open: price,
            time: epoch_now(),
        });

        Ok(json!({
            "retcode": TRADE_RETCODE_DONE,
            "deal": ticket,
            "order": ticket,
            "volume": volume,
            "price": price,
            "bid": tick.bid,
            "ask": tick.ask,
            "comment": "Request executed",
            "request_id": 0,
        }))
    }
}

impl Drop for SimTerminal {
    fn drop(&mut self) {
        // Best-effort cleanup on drop
        if let Some(mut child) = self.terminal_child.take() {
            let _ = child.kill();
        }
    }
}

fn epoch_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stable per-symbol seed (FNV-1a over the symbol name)
fn symbol_seed(symbol: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in symbol.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Deterministic mid price derived from the symbol name
fn base_price(symbol: &str) -> f64 {
    if symbol.contains("JPY") {
        90.0 + (symbol_seed(symbol) % 8_000) as f64 / 100.0
    } else if symbol.starts_with("XAU") {
        1_800.0 + (symbol_seed(symbol) % 40_000) as f64 / 100.0
    } else {
        0.8 + (symbol_seed(symbol) % 8_000) as f64 / 10_000.0
    }
}

fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn init_for(dir: &TempDir) -> TerminalInit {
        let exe = dir.path().join("terminal64.exe");
        fs::write(&exe, b"terminal binary").unwrap();
        TerminalInit {
            exe_path: exe,
            data_dir: dir.path().to_path_buf(),
            login: 42,
            password: "pw".into(),
            server: "srv-A".into(),
            timeout: Duration::from_secs(60),
        }
    }

    fn ready_terminal(dir: &TempDir) -> SimTerminal {
        let mut term = SimTerminal::new();
        term.initialize(&init_for(dir)).unwrap();
        term
    }

    #[test]
    fn test_initialize_rejects_missing_executable() {
        let tmp = TempDir::new().unwrap();
        let mut init = init_for(&tmp);
        init.exe_path = tmp.path().join("missing.exe");

        let err = SimTerminal::new().initialize(&init).unwrap_err();
        assert_eq!(err.code, codes::STARTUP_PATH_NOT_FOUND);
    }

    #[test]
    fn test_initialize_rejects_invalid_account() {
        let tmp = TempDir::new().unwrap();
        let mut init = init_for(&tmp);
        init.login = 0;
        init.password = String::new();
        init.server = String::new();

        let err = SimTerminal::new().initialize(&init).unwrap_err();
        assert_eq!(err.code, codes::AUTH_FAILED);
        assert_eq!(err.message, "invalid account");
    }

    #[test]
    fn test_commands_require_initialize() {
        let term = SimTerminal::new();
        let err = term.quote("EURUSD").unwrap_err();
        assert_eq!(err.code, codes::NOT_CONNECTED);
    }

    #[test]
    fn test_quote_is_deterministic_and_spread_positive() {
        let tmp = TempDir::new().unwrap();
        let term = ready_terminal(&tmp);

        let a = term.quote("EURUSD").unwrap();
        let b = term.quote("EURUSD").unwrap();
        assert_eq!(a.bid, b.bid);
        assert_eq!(a.ask, b.ask);
        assert!(a.ask > a.bid);
        assert!(a.time > 0);

        let other = term.quote("GBPUSD").unwrap();
        assert_ne!(a.bid, other.bid);
    }

    #[test]
    fn test_quote_rejects_empty_symbol() {
        let tmp = TempDir::new().unwrap();
        let term = ready_terminal(&tmp);
        let err = term.quote("").unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMETER);
    }

    #[test]
    fn test_candles_grid_and_count() {
        let tmp = TempDir::new().unwrap();
        let term = ready_terminal(&tmp);

        let bars = term.candles("EURUSD", Timeframe::M5, 10, Some(1_700_000_000)).unwrap();
        assert_eq!(bars.len(), 10);
        for pair in bars.windows(2) {
            assert_eq!(pair[1].time - pair[0].time, 300);
        }
        for bar in &bars {
            assert_eq!(bar.time % 300, 0);
            assert!(bar.high >= bar.open.max(bar.close));
            assert!(bar.low <= bar.open.min(bar.close));
        }

        // Same request, same bars
        let again = term.candles("EURUSD", Timeframe::M5, 10, Some(1_700_000_000)).unwrap();
        assert_eq!(bars[0].open, again[0].open);
        assert_eq!(bars[9].close, again[9].close);
    }

    #[test]
    fn test_symbol_select_and_totals() {
        let tmp = TempDir::new().unwrap();
        let mut term = ready_terminal(&tmp);

        let base = term.symbols_total().unwrap();
        term.symbol_select("BTCUSD", true).unwrap();
        assert_eq!(term.symbols_total().unwrap(), base + 1);
        term.symbol_select("BTCUSD", false).unwrap();
        assert_eq!(term.symbols_total().unwrap(), base);
        // Selecting a listed symbol does not change the total
        term.symbol_select("EURUSD", true).unwrap();
        assert_eq!(term.symbols_total().unwrap(), base);
    }

    #[test]
    fn test_order_send_creates_position() {
        let tmp = TempDir::new().unwrap();
        let mut term = ready_terminal(&tmp);

        let result = term
            .order_send(&json!({"symbol": "EURUSD", "volume": 0.1, "type": 0}))
            .unwrap();
        assert_eq!(result["retcode"], TRADE_RETCODE_DONE);
        assert!(result["order"].as_u64().unwrap() >= 1_000_000);

        let positions = term.positions_get(Some("EURUSD")).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0]["volume"], 0.1);
        assert!(term.positions_get(Some("GBPUSD")).unwrap().is_empty());
    }

    #[test]
    fn test_order_send_rejects_bad_volume() {
        let tmp = TempDir::new().unwrap();
        let mut term = ready_terminal(&tmp);
        let err = term
            .order_send(&json!({"symbol": "EURUSD", "volume": 0.0}))
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMETER);
    }

    #[cfg(unix)]
    #[test]
    fn test_initialize_launches_executable_terminal() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let mut init = init_for(&tmp);
        fs::write(&init.exe_path, b"#!/bin/sh\nexec sleep 60\n").unwrap();
        fs::set_permissions(&init.exe_path, fs::Permissions::from_mode(0o755)).unwrap();
        init.data_dir = tmp.path().to_path_buf();

        let mut term = SimTerminal::new();
        term.initialize(&init).unwrap();
        let pid = term.terminal_pid().expect("terminal pid should be reported");
        assert!(pid > 0);

        term.shutdown();
        assert!(term.terminal_pid().is_some(), "pid stays recorded after shutdown");
    }
}
