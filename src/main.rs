//! Loopback demonstration: send a file to yourself through the full stack.
//!
//! Both roles run inside this process against the in-memory rendezvous
//! store, which still exercises every stage end to end: offer/answer
//! signaling, ICE, the ordered data channel, chunking, backpressure, and
//! reassembly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use filebeam::{MemoryStore, Role, SessionMessage, SignalOfStop, TransferService};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send a file to yourself over a real WebRTC loopback")]
struct Args {
    /// File to transfer.
    file: PathBuf,

    /// Directory where the received copy is written.
    #[clap(long, default_value = ".")]
    out_dir: PathBuf,

    /// Verbosity (-v info, -vv debug, -vvv trace).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // webrtc_ice logs "unknown TransactionID" warnings for late STUN
    // responses, which are routine; keep that target quiet.
    let filter = match args.verbose {
        0 => "warn,filebeam=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let stop = SignalOfStop::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event = "interrupt", "Ctrl-C received; shutting down");
            interrupt.cancel();
        }
    });

    let store = Arc::new(MemoryStore::new());
    let (mut sender, mut sender_events) = TransferService::new(store.clone());
    let (mut receiver, mut receiver_events) = TransferService::new(store.clone());

    let session = sender
        .start_send(&args.file)
        .await
        .context("could not start the sending session")?;
    info!(event = "demo_session", %session, "Transferring over loopback");
    receiver.start_receive(session).await;

    let mut sender_done = false;
    let mut receiver_done = false;
    let mut failure: Option<String> = None;
    while !(sender_done && receiver_done) {
        let message = tokio::select! {
            _ = stop.wait() => break,
            msg = sender_events.recv() => msg,
            msg = receiver_events.recv() => msg,
        };
        let Some(message) = message else { break };
        match message {
            SessionMessage::Status(status) => info!(event = "status", "{status}"),
            SessionMessage::Progress { role, percent } => {
                info!(event = "progress", %role, percent, "Transfer progress");
            }
            SessionMessage::Completed {
                role: Role::Receiver,
                received,
            } => {
                receiver_done = true;
                if let Some(file) = received {
                    if !file.is_complete() {
                        warn!(
                            event = "incomplete_file",
                            name = %file.name,
                            "Received fewer bytes than declared"
                        );
                    }
                    let target = args.out_dir.join(file.sanitized_name());
                    tokio::fs::write(&target, &file.bytes)
                        .await
                        .with_context(|| format!("could not write {}", target.display()))?;
                    info!(
                        event = "file_saved",
                        path = %target.display(),
                        size = file.len(),
                        "Received copy written"
                    );
                }
            }
            SessionMessage::Completed {
                role: Role::Sender, ..
            } => {
                sender_done = true;
            }
            SessionMessage::Failed { role, reason } => {
                failure = Some(format!("{role} session failed: {reason}"));
                break;
            }
        }
    }

    sender.reset().await;
    receiver.reset().await;
    if let Some(reason) = failure {
        anyhow::bail!(reason);
    }
    info!(event = "demo_complete", "Both sessions finished");
    Ok(())
}
