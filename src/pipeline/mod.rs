//! Frontend pipeline (spec §4.2): four long-running stages —
//! preprocess, encode, dispatch, decode — each its own `std::thread`
//! (spec §5) pulling from a [`crate::queue::BoundedQueue`] fed by the stage
//! before it.
//!
//! Grounded on the teacher's `service/pipeline.rs` (a staged future driving
//! a transport and a service) and `backend/backend.rs` (a long-running
//! worker polling a work queue), reshaped from futures-polling to
//! blocking-thread-per-stage per spec §5's explicit concurrency model, and
//! on `original_source/src/frontend/Worker.cc` for the four-stage split
//! itself and the stripe/backup bookkeeping each stage touches.

pub mod decode;
pub mod dispatch;
pub mod encode;
pub mod preprocess;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::{Decoder, Encoder};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::filter::Filter;
use crate::message::{EncodeClass, Query, QidAllocator, Request};
use crate::monitor::Monitor;
use crate::queue::BoundedQueue;
use crate::stripe::StripeTracker;

/// Sends an encoded query's tensor bytes to a chosen backend for
/// inference. The wire protocol itself is out of this crate's scope (spec
/// §1 Non-goals); this is the seam a real gRPC/HTTP client plugs into.
pub trait BackendClient: Send + Sync {
    fn send_query(&self, backend_ip: &str, slot_index: usize, query: &Query) -> crate::errors::Result<()>;
}

/// One backend's answer for a single query, fed back into the decode
/// stage. Produced out-of-band by whatever receives the backend's reply
/// (a gRPC server, a mock, a test harness) and pushed onto the frontend's
/// outcome queue.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub qid: u64,
    pub sid: u64,
    pub class: EncodeClass,
    pub is_parity: bool,
    pub slot_index: usize,
    pub client_id: u64,
    pub recompute: bool,
    /// The backend this query was actually sent to, so the decode stage can
    /// ask the monitor whether it was marked broken since dispatch (spec
    /// §4.5). Empty for the end-of-stream sentinel and for members that
    /// never reached a backend at all (dispatcher starvation).
    pub backend_ip: String,
    pub stream: Arc<dyn crate::message::ReplySink>,
    /// `None` signals the backend/transport failed this query outright.
    pub result: Option<Bytes>,
    /// Round-trip time the transport measured for this query, in
    /// milliseconds (spec §4.6's `cdc_infer_time`/`backup_infer_time`
    /// source). `None` for the end-of-stream sentinel and for members that
    /// never reached a backend (dispatcher starvation, transport error
    /// before a reply could be timed).
    pub latency_ms: Option<f64>,
    /// `true` for the end-of-stream sentinel; every other field is
    /// meaningless when this is set.
    pub end_signal: bool,
}

/// One request as it arrives at the frontend, before preprocessing. The
/// preprocess stage is its own worker thread like every other stage (spec
/// §5), so a connection handler hands requests off through a queue rather
/// than calling the preprocessor inline.
pub struct RawRequest {
    pub request: Request,
    pub stream: Arc<dyn crate::message::ReplySink>,
}

/// An item that has been preprocessed and is ready for encoding.
pub struct PreprocessedItem {
    pub request: Request,
    pub tensor_bytes: Bytes,
    pub stream: Arc<dyn crate::message::ReplySink>,
}

/// An item that has been split into its stripe/backup-group members and is
/// ready for dispatch. A CDC group's `members` answer `k` *distinct*
/// original requests plus one parity member; a Backup group's `members` are
/// `1 + backup_num` replicas of the *same* original request — each `Query`
/// already carries its own `client_id`/`stream`, so nothing group-wide is
/// needed here beyond the stripe id and its tracker.
pub struct EncodedGroup {
    pub sid: u64,
    pub class: EncodeClass,
    pub tracker: Arc<StripeTracker>,
    pub members: Vec<Query>,
    /// `true` for one client connection's end-of-stream marker. The stage
    /// threads are shared across every connection a frontend serves, so
    /// this flows through unchanged and is simply skipped rather than
    /// ending the worker itself.
    pub end_signal: bool,
}

/// Everything the decode stage needs to answer or recompute one original
/// request that rode in a stripe or backup group, beyond what travels on
/// the outcome itself. A Backup group has exactly one of these (every
/// replica shares the same original request); a CDC group has `k`, indexed
/// by the data slot each one answers — the parity member has no entry of
/// its own since it never carries an original client to reply to.
pub struct MemberMeta {
    pub stream: Arc<dyn crate::message::ReplySink>,
    pub client_id: u64,
    pub tensor_bytes: Bytes,
    pub model: String,
    pub scale: String,
    pub filename: String,
    pub frontend_id: u32,
    pub already_recompute: bool,
}

/// Per-stripe bookkeeping the decode stage consults once outcomes start
/// arriving: the shared completion tracker plus each data member's own
/// metadata, so a reply or a recompute always goes out under the right
/// original request instead of some group-wide stand-in.
pub struct GroupEntry {
    pub tracker: Arc<StripeTracker>,
    pub members: Vec<MemberMeta>,
}

/// The frontend's own rolling view of its last measured CDC reply latency,
/// Backup reply latency, and decode duration (spec §4.6), piggybacked onto
/// every outgoing query so the backend's adaptive batch sizer can compare
/// the two classes. One lock guards all three so a reader always sees them
/// as of the same instant rather than three independently-updated numbers.
///
/// Grounded on `original_source/src/frontend/Worker.cc`'s process-wide
/// `cdc_infer_time_`/`backup_infer_time_`/`decode_time_` statics, updated
/// wherever the reply reader or the decode stage measures one of those
/// durations and read back out wherever a query is about to be sent.
#[derive(Debug, Default)]
struct LatencyInner {
    cdc_infer_time: f64,
    backup_infer_time: f64,
    decode_time: f64,
}

#[derive(Debug, Default)]
pub struct LatencyStats {
    inner: Mutex<LatencyInner>,
}

impl LatencyStats {
    pub fn new() -> LatencyStats {
        LatencyStats::default()
    }

    pub fn update_cdc(&self, latency_ms: f64) {
        self.inner.lock().cdc_infer_time = latency_ms;
    }

    pub fn update_backup(&self, latency_ms: f64) {
        self.inner.lock().backup_infer_time = latency_ms;
    }

    pub fn update_decode(&self, latency_ms: f64) {
        self.inner.lock().decode_time = latency_ms;
    }

    /// Returns `(cdc_infer_time, backup_infer_time, decode_time)` as of
    /// right now.
    pub fn snapshot(&self) -> (f64, f64, f64) {
        let inner = self.inner.lock();
        (inner.cdc_infer_time, inner.backup_infer_time, inner.decode_time)
    }
}

/// Shared, read-only context every stage needs. Cheap to clone (an `Arc`
/// wrapper would also work; kept as a plain struct of `Arc`s since each
/// field already has independent lifetime needs).
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub filter: Arc<Filter>,
    pub monitor: Arc<Monitor>,
    pub dispatcher: Arc<Dispatcher>,
    pub encoder: Arc<dyn Encoder>,
    pub decoder: Arc<dyn Decoder>,
    pub qids: Arc<QidAllocator>,
    pub backend_client: Arc<dyn BackendClient>,
    pub groups: Arc<Mutex<HashMap<u64, Arc<GroupEntry>>>>,
    pub latency: Arc<LatencyStats>,
}

/// The full frontend pipeline: owns the inter-stage queues and the four
/// worker threads.
pub struct Frontend {
    pub raw_queue: Arc<BoundedQueue<RawRequest>>,
    pub input_queue: Arc<BoundedQueue<PreprocessedItem>>,
    pub encoded_queue: Arc<BoundedQueue<EncodedGroup>>,
    pub outcome_queue: Arc<BoundedQueue<QueryOutcome>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl Frontend {
    /// Spawns the preprocess, encode, dispatch, and decode worker threads
    /// (spec §5: each pipeline stage is its own long-running thread). A
    /// connection handler pushes onto `raw_queue`; the preprocess worker
    /// drains it and feeds `input_queue`, from which the encode stage reads.
    ///
    /// `outcome_queue` is taken rather than created here since a real
    /// `BackendClient` (one whose replies arrive asynchronously on another
    /// thread) needs the same queue handle before `PipelineContext` — and
    /// so this `Frontend` — can be built.
    pub fn spawn(ctx: PipelineContext, queue_capacity: usize, outcome_queue: Arc<BoundedQueue<QueryOutcome>>) -> Frontend {
        let raw_queue = Arc::new(BoundedQueue::new(Some(queue_capacity)));
        let input_queue = Arc::new(BoundedQueue::new(Some(queue_capacity)));
        let encoded_queue = Arc::new(BoundedQueue::new(Some(queue_capacity)));

        let mut handles = Vec::new();

        {
            let ctx = ctx.clone();
            let raw_queue = raw_queue.clone();
            let input_queue = input_queue.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("inferflow-preprocess".into())
                    .spawn(move || preprocess::run(ctx, raw_queue, input_queue))
                    .expect("failed to spawn preprocess stage"),
            );
        }
        {
            let ctx = ctx.clone();
            let input_queue = input_queue.clone();
            let encoded_queue = encoded_queue.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("inferflow-encode".into())
                    .spawn(move || encode::run(ctx, input_queue, encoded_queue))
                    .expect("failed to spawn encode stage"),
            );
        }
        {
            let ctx = ctx.clone();
            let encoded_queue = encoded_queue.clone();
            let outcome_queue = outcome_queue.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("inferflow-dispatch".into())
                    .spawn(move || dispatch::run(ctx, encoded_queue, outcome_queue))
                    .expect("failed to spawn dispatch stage"),
            );
        }
        {
            let ctx = ctx.clone();
            let outcome_queue = outcome_queue.clone();
            let input_queue = input_queue.clone();
            handles.push(
                std::thread::Builder::new()
                    .name("inferflow-decode".into())
                    .spawn(move || decode::run(ctx, outcome_queue, input_queue))
                    .expect("failed to spawn decode stage"),
            );
        }

        Frontend {
            raw_queue,
            input_queue,
            encoded_queue,
            outcome_queue,
            handles,
        }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
