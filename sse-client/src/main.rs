use anyhow::{bail, Result};
use clap::Parser;
use colored::*;
use reqwest::Method;
use sse_client::{EventSource, MessageEvent, SourceOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

mod output;

use output::{print_event, print_lifecycle, print_summary};

#[derive(Parser)]
#[command(name = "sse-test-client")]
#[command(about = "Connects to a beacon-tracked SSE endpoint and prints its events")]
struct Cli {
    /// Stream resource (e.g., http://localhost:4000/events)
    #[arg(long)]
    url: String,

    /// Comma separated event names to listen for
    #[arg(long, value_delimiter = ',', default_value = "message")]
    events: Vec<String>,

    /// HTTP method of the stream and beacon requests
    #[arg(long, default_value = "POST")]
    method: String,

    /// Extra request header (format: name:value), repeatable
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Beacon interval in milliseconds, 0 disables beacons
    #[arg(long, default_value_t = 5000)]
    beacon_ms: u64,

    /// Exit after this many events
    #[arg(long)]
    count: Option<usize>,

    /// Give up after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Reopen the stream when the server closes it
    #[arg(long)]
    reconnect: bool,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

enum Update {
    Event(MessageEvent),
    Closed { is_local: bool },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    let method = Method::from_bytes(cli.method.to_uppercase().as_bytes())?;
    let mut options = SourceOptions::default()
        .method(method)
        .beacon(Duration::from_millis(cli.beacon_ms))
        .reconnect(cli.reconnect)
        .cache(false);
    for header in &cli.headers {
        let Some((name, value)) = header.split_once(':') else {
            bail!("Invalid header format. Expected name:value, got {}", header);
        };
        options = options.header(name.trim(), value.trim());
    }

    println!("{} Connecting to {}...", "→".blue(), cli.url);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let source = Arc::new(EventSource::new(reqwest::Client::new(), &cli.url, options));
    for event in &cli.events {
        let tx = tx.clone();
        source.add_listener(event, move |message| {
            let _ = tx.send(Update::Event(message.clone()));
        });
    }
    source.on_open(print_lifecycle);
    source.on_error(print_lifecycle);
    let closes = tx.clone();
    let reconnect = cli.reconnect;
    source.on_close(move |event| {
        print_lifecycle(event);
        if event.is_local || !reconnect {
            let _ = closes.send(Update::Closed {
                is_local: event.is_local,
            });
        }
    });
    drop(tx);

    let started = Instant::now();
    let deadline = cli
        .timeout_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let mut received = 0;
    source.connect();

    loop {
        let update = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(update) => update,
                Err(_) => {
                    println!("{} Timed out", "✗".red());
                    break;
                }
            },
            None => rx.recv().await,
        };

        match update {
            Some(Update::Event(event)) => {
                print_event(&event);
                received += 1;
                if cli.count.is_some_and(|count| received >= count) {
                    source.close();
                    break;
                }
            }
            Some(Update::Closed { is_local }) => {
                if !is_local {
                    println!("{} Server ended the stream", "→".blue());
                }
                break;
            }
            None => break,
        }
    }

    source.close();
    print_summary(received, started.elapsed());

    let satisfied = cli.count.map_or(true, |count| received >= count);
    std::process::exit(if satisfied { 0 } else { 1 });
}
