//! Client-visible requests/replies and the internal per-task `Query` record.
//!
//! Grounded on `original_source/src/frontend/query.hh` (`Query`,
//! `SingleQuery`) and `original_source/src/backend/query.hh` (`BatchQuery`),
//! reshaped into owned, arena-friendly Rust values per the §9 design note
//! ("queries as arena-allocated values indexed by qid").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// High bit reserved for parity qids so they never collide with data qids,
/// per the stripe invariant in spec §3 ("parity qids live in a disjoint
/// high range").
const PARITY_QID_BASE: u64 = 1 << 48;

/// Process-wide qid allocator. Two independent counters (data, parity) so
/// that no locking is needed across the data/parity split; uniqueness
/// within each range is all that's required.
#[derive(Debug, Default)]
pub struct QidAllocator {
    next_data: AtomicU64,
    next_parity: AtomicU64,
}

impl QidAllocator {
    pub fn new() -> Self {
        QidAllocator {
            next_data: AtomicU64::new(0),
            next_parity: AtomicU64::new(PARITY_QID_BASE),
        }
    }

    pub fn next_data_qid(&self) -> u64 {
        self.next_data.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_parity_qid(&self) -> u64 {
        self.next_parity.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_stripe_id(&self) -> u64 {
        // Stripe ids share the data counter's namespace; they only need to
        // be unique, not disjoint from qids.
        self.next_data.fetch_add(1, Ordering::Relaxed)
    }
}

/// The encoding scheme a query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncodeClass {
    Backup,
    Cdc,
}

impl fmt::Display for EncodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeClass::Backup => write!(f, "Backup"),
            EncodeClass::Cdc => write!(f, "CDC"),
        }
    }
}

/// Preprocessing format, per `preprocess_config.format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorFormat {
    Nhwc,
    Nchw,
}

/// Preprocessing scale, per `preprocess_config` / the client-visible
/// `scale` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scale {
    None,
    Vgg,
    Inception,
}

impl Scale {
    pub fn parse(s: &str) -> Option<Scale> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Some(Scale::None),
            "VGG" => Some(Scale::Vgg),
            "INCEPTION" => Some(Scale::Inception),
            _ => None,
        }
    }
}

/// A request as it arrives from a client, per spec §3 / §6.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub model: String,
    pub scale: String,
    pub filename: String,
    pub bytes: Bytes,
    pub end_signal: bool,
    pub recompute: bool,
    pub frontend_id: u32,
}

impl Request {
    pub fn end_signal_for(frontend_id: u32) -> Request {
        Request {
            id: 0,
            model: String::new(),
            scale: String::new(),
            filename: String::new(),
            bytes: Bytes::new(),
            end_signal: true,
            recompute: false,
            frontend_id,
        }
    }
}

/// A reply as it is sent back to a client, per spec §6.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u64,
    pub reply_info: Bytes,
    pub recompute: bool,
}

/// Where a query's eventual reply should be delivered. The RPC surface
/// itself is out of scope (spec §1); this models only the hand-off.
pub trait ReplySink: Send + Sync {
    fn send_reply(&self, reply: Reply);
}

/// A `ReplySink` that forwards into an async channel; the binaries wire
/// this to the actual client-facing stream.

pub struct ChannelReplySink {
    pub tx: tokio::sync::mpsc::UnboundedSender<Reply>,
}

impl ReplySink for ChannelReplySink {
    fn send_reply(&self, reply: Reply) {
        // A client that has disappeared mid-stream is not this layer's
        // concern; the session owner observes channel closure itself.
        let _ = self.tx.send(reply);
    }
}

/// The internal per-task record produced after preprocessing, per spec §3.
///
/// Queries travel by value through the pipeline's queues rather than being
/// indexed in a shared arena; `qid` is the stable identifier a backend
/// outcome carries back to correlate with its originating group, independent
/// of anything about how the query itself was stored in flight.
#[derive(Clone)]
pub struct Query {
    pub qid: u64,
    pub sid: u64,
    pub class: EncodeClass,
    pub is_parity: bool,
    pub model: String,
    pub scale: String,
    pub filename: String,
    pub tensor_bytes: Option<Bytes>,
    pub stream: std::sync::Arc<dyn ReplySink>,
    pub front_id: u32,
    pub recompute: bool,
    pub end_signal: bool,
    /// Client-visible id this query ultimately answers for. For CDC data
    /// queries and Backup replicas this is the same across the whole
    /// group; recompute preserves it across the retry.
    pub client_id: u64,
    /// The frontend's own latest measured CDC/Backup reply latency and
    /// decode duration (spec §4.6), piggybacked onto every outgoing query so
    /// the backend's adaptive batch sizer can compare the two classes
    /// without a side-channel RPC. Stamped by the dispatch stage right
    /// before the query leaves the frontend; `0.0` until the frontend has
    /// measured anything.
    pub cdc_infer_time: f64,
    pub backup_infer_time: f64,
    pub decode_time: f64,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.qid)
            .field("sid", &self.sid)
            .field("class", &self.class)
            .field("is_parity", &self.is_parity)
            .field("client_id", &self.client_id)
            .field("recompute", &self.recompute)
            .field("end_signal", &self.end_signal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_and_parity_qids_never_collide() {
        let alloc = QidAllocator::new();
        let d1 = alloc.next_data_qid();
        let d2 = alloc.next_data_qid();
        let p1 = alloc.next_parity_qid();
        assert_ne!(d1, d2);
        assert!(p1 >= PARITY_QID_BASE);
        assert!(d1 < PARITY_QID_BASE && d2 < PARITY_QID_BASE);
    }

    #[test]
    fn scale_parses_case_insensitively() {
        assert_eq!(Scale::parse("vgg"), Some(Scale::Vgg));
        assert_eq!(Scale::parse("INCEPTION"), Some(Scale::Inception));
        assert_eq!(Scale::parse("bogus"), None);
    }
}
