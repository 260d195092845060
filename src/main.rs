//! Command line front end for the query gateway.
//!
//! Run with:
//!   dbtunnel "SELECT id, name FROM auctions LIMIT 5"
//!   dbtunnel --config tunnel.json < statements.sql

use anyhow::{Context, Result};
use dbtunnel::{Config, GatewayError, QueryGateway};
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, BufReader};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const USAGE: &str = "\
Usage: dbtunnel [--config <file.json>] [SQL]

Runs SQL against the database behind the SSH bastion and prints each row as a
JSON object. Without SQL, reads one statement per line from stdin.

Settings come from the environment (SSH_HOST, SSH_USER, DB_HOST, DB_USER,
DB_NAME, ...) unless --config is given.";

struct Args {
    config: Option<PathBuf>,
    sql: Option<String>,
}

fn parse_args() -> Result<Option<Args>> {
    let mut config = None;
    let mut sql = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-c" | "--config" => {
                let path = args.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            other if other.starts_with('-') => anyhow::bail!("Unknown option {}", other),
            _ if sql.is_some() => anyhow::bail!("Pass the statement as a single argument"),
            _ => sql = Some(arg),
        }
    }

    Ok(Some(Args { config, sql }))
}

fn main() -> ExitCode {
    // Must happen before any thread exists so every thread inherits the mask
    let signals = match block_shutdown_signals() {
        Ok(set) => set,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dbtunnel=info")),
        )
        .init();

    match run(signals) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn run(signals: libc::sigset_t) -> Result<bool> {
    let Some(args) = parse_args()? else {
        println!("{}", USAGE);
        return Ok(true);
    };

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    let interrupts = spawn_signal_thread(signals)?;
    let gateway = Arc::new(QueryGateway::new(&config));

    smol::block_on(async {
        let work = async {
            match &args.sql {
                Some(sql) => run_statement(&gateway, sql).await,
                None => run_lines(&gateway).await,
            }
        };
        let interrupted = async {
            if let Ok(signal) = interrupts.recv().await {
                tracing::info!("Received signal {}, shutting down", signal);
            }
            Ok(false)
        };

        let outcome = smol::future::or(work, interrupted).await;
        gateway.shutdown().await;
        outcome
    })
}

async fn run_statement(gateway: &QueryGateway, sql: &str) -> Result<bool> {
    match gateway.execute(sql, ()).await {
        Ok(rows) => {
            let mut out = std::io::stdout().lock();
            for row in &rows {
                writeln!(out, "{}", serde_json::to_string(row)?)?;
            }
            out.flush()?;
            Ok(true)
        }
        Err(e) => {
            report(&e);
            Ok(false)
        }
    }
}

/// One statement per line until EOF. Failures are reported and the loop
/// keeps going; the exit status says whether every statement succeeded.
async fn run_lines(gateway: &QueryGateway) -> Result<bool> {
    let stdin = BufReader::new(smol::Unblock::new(std::io::stdin()));
    let mut lines = stdin.lines();
    let mut all_ok = true;

    while let Some(line) = lines.next().await {
        let line = line.context("Failed to read stdin")?;
        let sql = line.trim();
        if sql.is_empty() || sql.starts_with("--") {
            continue;
        }
        all_ok &= run_statement(gateway, sql).await?;
    }

    Ok(all_ok)
}

fn report(err: &GatewayError) {
    if err.is_infrastructure() {
        tracing::error!("Service unavailable: {}", err);
    }
    eprintln!("Error: {}", err);
}

fn block_shutdown_signals() -> Result<libc::sigset_t> {
    // SAFETY: sigset_t is plain data initialised by sigemptyset before use
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc))
                .context("Failed to block shutdown signals");
        }
        Ok(set)
    }
}

/// Wait for SIGINT/SIGTERM on a dedicated thread and forward them.
fn spawn_signal_thread(set: libc::sigset_t) -> Result<async_channel::Receiver<i32>> {
    let (tx, rx) = async_channel::bounded(1);
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            loop {
                let mut signal: libc::c_int = 0;
                // SAFETY: both pointers are valid for the duration of the call
                let rc = unsafe { libc::sigwait(&set, &mut signal) };
                if rc != 0 || tx.send_blocking(signal).is_err() {
                    break;
                }
            }
        })
        .context("Failed to start signal thread")?;
    Ok(rx)
}
