//! Backend binary (spec §6): accepts frontend connections, routes each
//! incoming query onto the rep/CDC recv queue by its encoding class, and
//! writes results back out on the connection they arrived on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use inferflow::backend::{Backend, BackendItem, BackendResult, ModelServer, OutcomeReporter};
use inferflow::cache::ReplyCache;
use inferflow::config::Config;
use inferflow::errors::{InferflowError, Result};
use inferflow::wire::{self, BackendWireRequest, BackendWireResult};

const BACKEND_PORT: u16 = 50051;

#[derive(Parser, Debug)]
#[command(name = "inferflow-backend")]
struct Args {
    /// Path to the JSON configuration document.
    config: PathBuf,
}

/// A model server stand-in: the actual Triton/model-serving call is out of
/// scope (spec §1 Non-goals), so this simply echoes each tensor back as its
/// own inference output, exercising the batching/latency plumbing around it.
struct EchoModelServer;

impl ModelServer for EchoModelServer {
    fn infer(&self, model: &str, batch: &[Bytes]) -> Vec<Option<Bytes>> {
        tracing::trace!(model, batch_size = batch.len(), "running echo inference");
        batch.iter().map(|b| Some(b.clone())).collect()
    }
}

/// Routes a `BackendResult` back out over whichever connection sent the
/// matching `origin` token, via a registry of per-connection result
/// channels populated as connections are accepted.
struct ConnectionRouter {
    senders: Mutex<HashMap<u64, tokio::sync::mpsc::UnboundedSender<BackendResult>>>,
}

impl ConnectionRouter {
    fn new() -> Self {
        ConnectionRouter { senders: Mutex::new(HashMap::new()) }
    }

    fn register(&self, origin: u64) -> tokio::sync::mpsc::UnboundedReceiver<BackendResult> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.senders.lock().insert(origin, tx);
        rx
    }

    fn unregister(&self, origin: u64) {
        self.senders.lock().remove(&origin);
    }
}

impl OutcomeReporter for ConnectionRouter {
    fn report(&self, result: BackendResult) {
        let sender = self.senders.lock().get(&result.origin).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                warn!(origin = result.origin, "no connection registered for this origin, dropping result");
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, origin: u64, backend: Arc<Backend>, router: Arc<ConnectionRouter>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut results = router.register(origin);

    let writer = tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            let wire_result = BackendWireResult {
                qid: result.qid,
                sid: result.sid,
                is_parity: result.is_parity,
                origin: result.origin,
                output: result.output.map(|b| b.to_vec()),
            };
            if wire::write_frame(&mut write_half, &wire_result).await.is_err() {
                break;
            }
        }
    });

    loop {
        match wire::read_frame::<_, BackendWireRequest>(&mut read_half).await {
            Ok(Some(req)) => {
                let item = BackendItem {
                    qid: req.qid,
                    sid: req.sid,
                    class: req.class,
                    is_parity: req.is_parity,
                    model: req.model,
                    filename: req.filename,
                    tensor_bytes: Bytes::from(req.tensor_bytes),
                    origin,
                    recompute: req.recompute,
                    end_signal: req.end_signal,
                    cdc_infer_time: req.cdc_infer_time,
                    backup_infer_time: req.backup_infer_time,
                    decode_time: req.decode_time,
                };
                backend.recv(item);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "frontend connection read error");
                break;
            }
        }
    }

    router.unregister(origin);
    let _ = writer.await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let router = Arc::new(ConnectionRouter::new());
    let model_server: Arc<dyn ModelServer> = Arc::new(EchoModelServer);
    let cache = Arc::new(ReplyCache::new(config.cache_config.use_cache, config.cache_config.capacity));
    let backend = Arc::new(Backend::spawn(config.batch_config.clone(), cache, model_server, router.clone()));

    let listener = TcpListener::bind(("0.0.0.0", BACKEND_PORT))
        .await
        .map_err(|e| InferflowError::Transport { backend: "self".to_string(), source: e })?;
    info!(port = BACKEND_PORT, "backend listening");

    let next_origin = AtomicU64::new(1);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let origin = next_origin.fetch_add(1, Ordering::Relaxed);
                info!(%addr, origin, "accepted frontend connection");
                tokio::spawn(handle_connection(stream, origin, backend.clone(), router.clone()));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}
