use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use receipt_usb::config::{self, PrinterConfig};
use receipt_usb::platform;
use receipt_usb::printer::discovery::scan_for_printers;
use receipt_usb::printer::{NusbHost, PrinterSession, DEVICE_PROFILES};

#[derive(Parser, Debug)]
#[command(name = "receipt-usb", version, about = "Drive USB receipt printers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached printers the catalog recognizes
    List {
        #[arg(long)]
        json: bool,
    },
    /// Send a file (or stdin) to the printer as raw bytes
    Print {
        file: Option<PathBuf>,
        #[arg(long)]
        serial: Option<String>,
    },
    /// Dump data the printer sends back until Ctrl-C
    Listen {
        #[arg(long)]
        serial: Option<String>,
    },
    /// Check for common USB access problems
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("receipt_usb=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "Starting receipt-usb");

    match args.command {
        Command::List { json } => list(json).await,
        Command::Print { file, serial } => print(file, serial).await,
        Command::Listen { serial } => listen(serial).await,
        Command::Doctor => {
            doctor();
            Ok(())
        }
    }
}

async fn list(json: bool) -> anyhow::Result<()> {
    let printers = scan_for_printers(DEVICE_PROFILES)
        .await
        .context("Failed to enumerate USB devices")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&printers)?);
        return Ok(());
    }

    if printers.is_empty() {
        println!("No supported printers found");
    }
    for p in &printers {
        println!(
            "{:04x}:{:04x}  {:<24} {:<12} {:<14} {}",
            p.vendor_id,
            p.product_id,
            p.model_name,
            p.language,
            p.codepage_mapping,
            p.serial.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Reconnect to the configured printer if there is one, otherwise take the
/// first supported printer attached.
async fn open_session(serial: Option<String>) -> anyhow::Result<PrinterSession<NusbHost>> {
    let mut config: PrinterConfig = config::load_config()?;
    if serial.is_some() {
        config.serial = serial;
    }

    let host = NusbHost::new().with_preferred_serial(config.serial.clone());
    let session = PrinterSession::with_options(host, config.session_options());

    let info = session
        .reconnect_or_connect(config.reconnect_target().as_ref())
        .await
        .context("No supported printer could be opened")?;
    tracing::info!(serial = ?info.serial_number, "Printer ready");
    Ok(session)
}

async fn print(file: Option<PathBuf>, serial: Option<String>) -> anyhow::Result<()> {
    let data = match &file {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            buf
        }
    };
    if data.is_empty() {
        bail!("Nothing to print");
    }

    let session = open_session(serial).await?;
    let result = session.print(data).await;
    session.disconnect().await?;

    let written = result.context("Print failed")?;
    println!("Sent {written} bytes");
    Ok(())
}

async fn listen(serial: Option<String>) -> anyhow::Result<()> {
    let session = open_session(serial).await?;
    if let Some(profile) = session.profile() {
        println!("Connected using profile {}", profile.name);
    }

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    let disconnected = stop_tx.clone();
    session.on_data(|data| println!("{}", hex_line(data)));
    session.on_listen_stopped(move |reason| {
        let _ = stop_tx.send(format!("Read loop stopped: {reason}"));
    });
    session.on_disconnected(move || {
        let _ = disconnected.send("Printer disconnected".to_string());
    });

    let watcher = session.watch_disconnects()?;
    if !session.listen().await {
        session.disconnect().await?;
        bail!("Printer has no input endpoint");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
        Some(reason) = stop_rx.recv() => {
            println!("{reason}");
        }
    }

    watcher.abort();
    session.disconnect().await?;
    Ok(())
}

fn doctor() {
    let warnings = platform::check_prerequisites();
    if warnings.is_empty() {
        println!("No USB access problems found");
    }
    for warning in warnings {
        println!("warning: {warning}");
    }
}

fn hex_line(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
