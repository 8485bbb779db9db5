//! Length-prefixed JSON framing used by the three binaries to talk to each
//! other. The wire protocol's own correctness is out of spec.md's scope
//! (§1 Non-goals call out "the RPC framework/serialization format"); this
//! is deliberately the simplest thing that lets the three binaries in this
//! crate demonstrate the pipeline end-to-end without pulling in a real RPC
//! stack the corpus doesn't otherwise need.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_frame<S, T>(stream: &mut S, value: &T) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).expect("wire types always serialize");
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

/// Reads one frame, returning `Ok(None)` on a clean EOF between frames
/// (the peer closed the connection).
pub async fn read_frame<S, T>(stream: &mut S) -> std::io::Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WireRequest {
    pub id: u64,
    pub model: String,
    pub scale: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub end_signal: bool,
    pub recompute: bool,
}

/// A client never measures CDC/Backup/decode latency itself (only a
/// frontend's own `Worker` does, per spec §4.6) — `WireRequest` carries no
/// latency fields at all; they first appear on `BackendWireRequest`, which
/// the frontend builds after stamping a `Query` with its own measurements.

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WireReply {
    pub id: u64,
    pub reply_info: Vec<u8>,
    pub recompute: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendWireRequest {
    pub qid: u64,
    pub sid: u64,
    pub class: crate::message::EncodeClass,
    pub is_parity: bool,
    pub model: String,
    pub filename: String,
    pub tensor_bytes: Vec<u8>,
    pub origin: u64,
    pub recompute: bool,
    pub end_signal: bool,
    /// Piggybacked latency measurements (spec §4.6) driving the backend's
    /// adaptive batch sizer; see `crate::message::Query`.
    pub cdc_infer_time: f64,
    pub backup_infer_time: f64,
    pub decode_time: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendWireResult {
    pub qid: u64,
    pub sid: u64,
    pub is_parity: bool,
    pub origin: u64,
    pub output: Option<Vec<u8>>,
}
