use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_sync::{StreamEvent, SyncConfig, SyncEngine, SyncHandle};

#[derive(Parser)]
#[command(name = "chat-sync")]
#[command(about = "Follow a chat backend's realtime event stream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./chat_sync.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow one session: connection changes, streaming text, merged history
    Tail(TailArgs),

    /// Print every parsed push event as a JSON line
    Events,
}

#[derive(Parser)]
struct TailArgs {
    /// Session key to follow
    #[arg(short, long)]
    session: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the output.
    let default_directive = if cli.debug {
        "chat_sync=debug,warn"
    } else {
        "chat_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = SyncConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    info!(endpoint = %config.events_url, "starting chat-sync");
    let handle = SyncEngine::spawn_http(config).context("Failed to start sync engine")?;

    let result = match cli.command {
        Commands::Tail(args) => tail_command(&handle, &args.session).await,
        Commands::Events => events_command(&handle).await,
    };
    handle.shutdown().await;
    result
}

async fn tail_command(handle: &SyncHandle, session: &str) -> Result<()> {
    let mut status = handle.watch_connection();
    let mut events = handle.subscribe_events();
    let mut views = handle.subscribe_views();
    handle.set_active_session(Some(session)).await?;

    let mut last_state = status.borrow().state;
    println!("[connection] {:?}", last_state);

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.state != last_state {
                    last_state = snapshot.state;
                    match (&snapshot.last_error, snapshot.next_reconnect_in) {
                        (Some(error), Some(delay)) => println!(
                            "[connection] {:?} ({}; retrying in {}ms)",
                            last_state,
                            error,
                            delay.as_millis()
                        ),
                        _ => println!("[connection] {:?}", last_state),
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) if event.session_key() == Some(session) => print_stream_event(&event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
            view = views.recv() => {
                match view {
                    Ok(view) if view.session_key == session => {
                        println!("[history] {} messages", view.messages.len());
                        for message in &view.messages {
                            println!("  {:?}: {}", message.role, message.rendered_text());
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn print_stream_event(event: &StreamEvent) {
    match event {
        StreamEvent::Chunk(chunk) => println!("[streaming] {}", chunk.text),
        StreamEvent::Thinking(thinking) => println!("[thinking] {}", thinking.text),
        StreamEvent::Tool(tool) => println!("[tool] {} {:?}", tool.name, tool.phase),
        StreamEvent::Done(done) => match &done.error_message {
            Some(error) => println!("[done] {:?}: {}", done.state, error),
            None => println!("[done] {:?}", done.state),
        },
        _ => {}
    }
}

async fn events_command(handle: &SyncHandle) -> Result<()> {
    let mut events = handle.subscribe_events();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => println!("{}", serde_json::to_string(&event)?),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
