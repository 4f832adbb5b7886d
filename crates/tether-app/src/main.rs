//! `tether`: a headless terminal host driven over stdin/stdout.
//!
//! Reads one JSON request per line from stdin and writes replies and
//! terminal events to stdout as JSON lines. Logs go to stderr.

mod commands;
mod ipc;
mod sink;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tether_pty::{TerminalConfig, TerminalManager};

use ipc::{Outbox, Outgoing, Request, RequestEnvelope, Response};
use sink::EventSink;

/// Headless PTY terminal host speaking JSON lines on stdio
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, value_name = "PATH", env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();
    init_logging();

    let config = match &args.config {
        Some(path) => match TerminalConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("fatal: {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => TerminalConfig::default(),
    };

    let manager = TerminalManager::new(config);
    let outbox = Arc::new(Outbox::stdout());
    manager.set_event_listener(Arc::new(EventSink::new(Arc::clone(&outbox))));

    log::info!(
        "tether v{} ready on {}",
        env!("CARGO_PKG_VERSION"),
        tether_pty::platform_name()
    );
    serve(&manager, std::io::stdin().lock(), &outbox);

    manager.cleanup();
    log::info!("tether stopped");
}

/// Log to stderr; stdout carries the protocol.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .init();
}

/// Answer requests until EOF or a `shutdown` request.
fn serve(manager: &TerminalManager, input: impl BufRead, outbox: &Outbox) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("Failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: RequestEnvelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Rejected request: {e}");
                let request_id = serde_json::from_str::<serde_json::Value>(&line)
                    .ok()
                    .and_then(|raw| raw.get("request_id").cloned());
                let reply = Response::from_result(request_id, Err(format!("Invalid request: {e}")));
                outbox.send(&Outgoing::Response(reply));
                continue;
            }
        };

        let shutdown = envelope.request == Request::Shutdown;
        let result = commands::dispatch(manager, envelope.request);
        outbox.send(&Outgoing::Response(Response::from_result(
            envelope.request_id,
            result,
        )));
        if shutdown {
            log::info!("Shutdown requested");
            break;
        }
    }
}
