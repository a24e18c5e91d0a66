//! Worker process runtime
//!
//! One worker per session. The bridge spawns this program, writes a
//! credentials line to its stdin, and expects an init line on stdout,
//! followed by exactly one response line per request. The worker is
//! strictly single-threaded; the vendor library is not reentrant.

pub mod dispatch;
pub mod sim;
pub mod terminal;

use clap::Parser;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::protocol::{CommandRequest, CommandResponse, CredentialsMessage, InitMessage};
use dispatch::dispatch;
use sim::SimTerminal;
use terminal::{TerminalApi, TerminalInit};

/// Vendor initialize timeout; prevents an unreachable broker from hanging the spawn
const INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Command-line arguments the bridge passes at spawn
///
/// The password is deliberately absent: it arrives as the first stdin line
/// so it never shows up in the process listing.
#[derive(Parser, Debug)]
#[command(name = "mt5-worker")]
#[command(about = "Session worker: drives one terminal instance over line-delimited JSON")]
pub struct WorkerArgs {
    /// Session id, used for log correlation only
    #[arg(long)]
    pub id: String,

    /// Trading account login
    #[arg(long)]
    pub login: i64,

    /// Broker server name
    #[arg(long)]
    pub server: String,

    /// Isolated installation root this worker owns
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Terminal executable inside the data dir
    #[arg(long)]
    pub exe_path: PathBuf,

    /// Speak the line protocol over TCP loopback instead of stdio
    #[arg(long)]
    pub ipc_port: Option<u16>,
}

/// Worker entry point; returns the process exit code
pub fn run(args: WorkerArgs) -> ExitCode {
    // Keep the emulation prefix inside the session's own directory
    #[cfg(not(windows))]
    {
        std::env::set_var("WINEPREFIX", &args.data_dir);
        std::env::set_var("WINEARCH", "win64");
    }

    let (mut reader, mut writer): (Box<dyn BufRead>, Box<dyn Write>) = match open_transport(
        args.ipc_port,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            // The transport never came up; stdout is the only channel left
            let msg = InitMessage::failure(format!("transport unavailable: {e}"));
            println!("{}", serde_json::to_string(&msg).unwrap_or_default());
            return ExitCode::FAILURE;
        }
    };

    let password = match read_credentials(&mut reader) {
        Ok(password) => password,
        Err(e) => {
            write_line(&mut writer, &InitMessage::failure(e)).ok();
            return ExitCode::FAILURE;
        }
    };

    let mut terminal = SimTerminal::new();
    let init = TerminalInit {
        exe_path: args.exe_path.clone(),
        data_dir: args.data_dir.clone(),
        login: args.login,
        password,
        server: args.server.clone(),
        timeout: INIT_TIMEOUT,
    };

    if let Err(e) = terminal.initialize(&init) {
        error!(session_id = %args.id, error = %e, "Terminal initialization failed");
        write_line(&mut writer, &InitMessage::failure(e.to_string())).ok();
        return ExitCode::FAILURE;
    }

    info!(
        session_id = %args.id,
        login = args.login,
        server = %args.server,
        mt5_pid = ?terminal.terminal_pid(),
        "Terminal initialized"
    );

    if write_line(&mut writer, &InitMessage::success(terminal.terminal_pid())).is_err() {
        terminal.shutdown();
        return ExitCode::FAILURE;
    }

    if let Err(e) = serve(&mut reader, &mut writer, &mut terminal) {
        warn!(session_id = %args.id, error = %e, "Command loop ended on I/O error");
    }

    terminal.shutdown();
    info!(session_id = %args.id, "Worker exiting");
    ExitCode::SUCCESS
}

/// Read requests one line at a time until terminate or EOF
///
/// Every parseable request gets exactly one response line; a line that is
/// not valid JSON gets an error response and the loop continues.
pub fn serve<R: BufRead + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    terminal: &mut dyn TerminalApi,
) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            // EOF: the supervisor closed our stdin
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: CommandRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                write_line(writer, &CommandResponse::failure(format!("invalid request: {e}")))?;
                continue;
            }
        };

        if request.is_terminate() {
            return Ok(());
        }

        let response = dispatch(terminal, &request);
        write_line(writer, &response)?;
    }
}

/// Consume the credentials message the bridge writes before anything else
fn read_credentials<R: BufRead + ?Sized>(reader: &mut R) -> Result<String, String> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) => Err("credentials message missing: input closed".to_string()),
        Ok(_) => {
            let message: CredentialsMessage = serde_json::from_str(line.trim())
                .map_err(|e| format!("malformed credentials message: {e}"))?;
            if !message.is_credentials() {
                return Err(format!("expected credentials message, got '{}'", message.kind));
            }
            Ok(message.password)
        }
        Err(e) => Err(format!("failed to read credentials message: {e}")),
    }
}

fn open_transport(ipc_port: Option<u16>) -> io::Result<(Box<dyn BufRead>, Box<dyn Write>)> {
    match ipc_port {
        Some(port) => {
            let stream = TcpStream::connect(("127.0.0.1", port))?;
            let reader = BufReader::new(stream.try_clone()?);
            Ok((Box::new(reader), Box::new(stream)))
        }
        None => Ok((
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )),
    }
}

fn write_line<W: Write + ?Sized, T: serde::Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
