//! Frontend binary (spec §6): accepts client connections on its listen
//! port, preprocesses/encodes/dispatches each request across a CDC stripe
//! or Backup group, and streams replies back as each group resolves.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use inferflow::codec::{build_decoder, build_encoder};
use inferflow::config::{Config, Trace};
use inferflow::dispatcher::{Dispatcher, SelectionMode};
use inferflow::errors::{InferflowError, Result};
use inferflow::filter::{FeedbackKind, Filter, FilterMode};
use inferflow::message::{ChannelReplySink, QidAllocator, Query, Reply, Request};
use inferflow::monitor::Monitor;
use inferflow::pipeline::{BackendClient, Frontend, PipelineContext};
use inferflow::queue::BoundedQueue;
use inferflow::wire::{self, WireReply, WireRequest};

/// Default listen port for the frontend's client-facing socket.
const FRONTEND_PORT: u16 = 50052;
/// Fixed listen port every backend in the fleet is expected to serve on.
const BACKEND_PORT: u16 = 50051;

#[derive(Parser, Debug)]
#[command(name = "inferflow-frontend")]
struct Args {
    /// Path to the JSON configuration document.
    config: PathBuf,
}

fn parse_filter_mode(s: &str) -> FilterMode {
    match s {
        "auto" => FilterMode::Auto,
        _ => FilterMode::Manual,
    }
}

fn parse_feedback(s: &str) -> FeedbackKind {
    match s {
        "cost" => FeedbackKind::Cost,
        _ => FeedbackKind::Combinatorial,
    }
}

/// Dials a fresh TCP connection to the target backend for every query and
/// reads its single response on that same connection — the simplest
/// framing that keeps request/response correlation implicit rather than
/// needing a multiplexing layer this crate's scope doesn't call for.
struct TcpBackendClient {
    outcomes: Arc<BoundedQueue<inferflow::pipeline::QueryOutcome>>,
}

impl BackendClient for TcpBackendClient {
    fn send_query(&self, backend_ip: &str, slot_index: usize, query: &Query) -> Result<()> {
        let backend_addr = format!("{}:{}", backend_ip, BACKEND_PORT);
        let backend_ip = backend_ip.to_string();
        let outcomes = self.outcomes.clone();
        let qid = query.qid;
        let sid = query.sid;
        let class = query.class;
        let is_parity = query.is_parity;
        let client_id = query.client_id;
        let recompute = query.recompute;
        let model = query.model.clone();
        let filename = query.filename.clone();
        let tensor_bytes = query.tensor_bytes.clone().unwrap_or_default();
        let stream = query.stream.clone();
        let cdc_infer_time = query.cdc_infer_time;
        let backup_infer_time = query.backup_infer_time;
        let decode_time = query.decode_time;

        std::thread::Builder::new()
            .name(format!("inferflow-backend-call-{}", qid))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(backend = %backend_addr, error = %e, "failed to build per-call runtime");
                        outcomes.push(inferflow::pipeline::QueryOutcome {
                            qid,
                            sid,
                            class,
                            is_parity,
                            slot_index,
                            client_id,
                            recompute,
                            backend_ip,
                            stream,
                            result: None,
                            latency_ms: None,
                            end_signal: false,
                        });
                        return;
                    }
                };
                let start = Instant::now();
                let result = rt.block_on(async {
                    let mut conn = TcpStream::connect(&backend_addr).await?;
                    wire::write_frame(
                        &mut conn,
                        &inferflow::wire::BackendWireRequest {
                            qid,
                            sid,
                            class,
                            is_parity,
                            model,
                            filename,
                            tensor_bytes: tensor_bytes.to_vec(),
                            origin: 0,
                            recompute,
                            end_signal: false,
                            cdc_infer_time,
                            backup_infer_time,
                            decode_time,
                        },
                    )
                    .await?;
                    let response: Option<inferflow::wire::BackendWireResult> = wire::read_frame(&mut conn).await?;
                    Ok::<_, std::io::Error>(response)
                });
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

                let output = match result {
                    Ok(Some(resp)) => resp.output.map(bytes::Bytes::from),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(backend = %backend_addr, error = %e, "backend call failed");
                        None
                    }
                };

                outcomes.push(inferflow::pipeline::QueryOutcome {
                    qid,
                    sid,
                    class,
                    is_parity,
                    slot_index,
                    client_id,
                    recompute,
                    backend_ip,
                    stream,
                    result: output,
                    latency_ms: Some(latency_ms),
                    end_signal: false,
                });
            })
            .map_err(|e| InferflowError::Transport {
                backend: backend_ip.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;

        Ok(())
    }
}

async fn handle_client(stream: TcpStream, raw_queue: Arc<BoundedQueue<inferflow::pipeline::RawRequest>>, ctx: PipelineContext) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Reply>();
    let sink: Arc<dyn inferflow::message::ReplySink> = Arc::new(ChannelReplySink { tx });

    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let wire_reply = WireReply {
                id: reply.id,
                reply_info: reply.reply_info.to_vec(),
                recompute: reply.recompute,
            };
            if wire::write_frame(&mut write_half, &wire_reply).await.is_err() {
                break;
            }
        }
    });

    loop {
        match wire::read_frame::<_, WireRequest>(&mut read_half).await {
            Ok(Some(wire_req)) => {
                let request = Request {
                    id: wire_req.id,
                    model: wire_req.model,
                    scale: wire_req.scale,
                    filename: wire_req.filename,
                    bytes: bytes::Bytes::from(wire_req.bytes),
                    end_signal: wire_req.end_signal,
                    recompute: wire_req.recompute,
                    frontend_id: ctx.config.frontend_id,
                };
                raw_queue.push(inferflow::pipeline::RawRequest { request, stream: sink.clone() });
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "client connection read error");
                break;
            }
        }
    }

    drop(sink);
    let _ = writer.await;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::load(&args.config)?);

    let mut traces = Vec::with_capacity(config.backend_ips.len());
    for zone in &config.backend_ips {
        traces.push(Trace::load(&zone.trace)?);
    }

    let monitor = Arc::new(Monitor::new(&config, traces)?);
    let filter = Arc::new(Filter::new(
        parse_filter_mode(&config.filter_config.r#type),
        parse_feedback(&config.filter_config.feedback),
        config.filter_config.cdc_ratio,
        config.k,
        config.node_number,
        config.encode_config.backup_num,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        monitor.clone(),
        SelectionMode::parse(&config.monitor_config.selection),
        config.monitor_config.eta_1,
        config.monitor_config.eta_2,
    ));
    let encoder = Arc::from(build_encoder(&config.encode_config.encoder_type)?);
    let decoder = Arc::from(build_decoder(
        &config.decode_config.decoder_type,
        config.decode_config.decoder_simulate,
        config.decode_config.decoder_simulate_ms,
        config.decode_config.decoder_ckpt.clone(),
    )?);
    let qids = Arc::new(QidAllocator::new());
    let groups = Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new()));
    let latency = Arc::new(inferflow::pipeline::LatencyStats::new());

    let listener = TcpListener::bind(("0.0.0.0", FRONTEND_PORT))
        .await
        .map_err(|e| InferflowError::Transport { backend: "self".to_string(), source: e })?;
    info!(port = FRONTEND_PORT, "frontend listening");

    let outcome_queue: Arc<BoundedQueue<inferflow::pipeline::QueryOutcome>> =
        Arc::new(BoundedQueue::new(Some(config.batch_config.max_batch_size.max(16) * 4)));
    let backend_client: Arc<dyn BackendClient> = Arc::new(TcpBackendClient {
        outcomes: outcome_queue.clone(),
    });

    let ctx = PipelineContext {
        config: config.clone(),
        filter,
        monitor,
        dispatcher,
        encoder,
        decoder,
        qids,
        backend_client,
        groups,
        latency,
    };

    let frontend = Frontend::spawn(ctx.clone(), config.batch_config.max_batch_size.max(16), outcome_queue);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "accepted client connection");
                let raw_queue = frontend.raw_queue.clone();
                let ctx = ctx.clone();
                tokio::spawn(handle_client(stream, raw_queue, ctx));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
    }
}
