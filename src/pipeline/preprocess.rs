//! Preprocess stage (spec §4.2.1): validates/shapes the incoming payload
//! ahead of encoding. The reply cache itself lives on the backend (spec
//! §4.6/§4.7), not here; this stage's job is shape/dtype bookkeeping, not a
//! cache lookup.
//!
//! Grounded on `original_source/src/frontend/Worker.cc`'s first pipeline
//! step and `preprocess_config`'s format/dtype/channel/height/width keys
//! (SPEC_FULL §C.4). The actual image decode/resize/normalize math is out
//! of scope per spec §1's Non-goals ("the numerical correctness of any
//! specific encoding/decoding transform"); this stage's job is the
//! shape/dtype bookkeeping, not pixel math.

use std::sync::Arc;

use tracing::trace;

use crate::config::PreprocessConfig;
use crate::message::{ReplySink, Request};
use crate::queue::BoundedQueue;

use super::{PipelineContext, PreprocessedItem, RawRequest};

/// Drives the preprocess stage as its own worker thread (spec §5), the
/// same shape as every other stage: pulls raw requests off `input` and
/// pushes each shaped result onto `output` for the encode stage to pick up.
pub fn run(ctx: PipelineContext, input: Arc<BoundedQueue<RawRequest>>, output: Arc<BoundedQueue<PreprocessedItem>>) {
    loop {
        let raw = input.pop();
        if let Some(item) = preprocess_one(&ctx, raw.request, raw.stream) {
            output.push(item);
        }
    }
}

fn dtype_size(dtype: &str) -> usize {
    match dtype {
        "uint8" => 1,
        "float16" => 2,
        "float32" => 4,
        _ => 1,
    }
}

/// Expected tensor byte length for a fully-specified shape; `0` when any
/// dimension is left at its zero default (no check is then performed).
fn expected_len(cfg: &PreprocessConfig) -> usize {
    if cfg.channel == 0 || cfg.height == 0 || cfg.width == 0 {
        return 0;
    }
    cfg.channel as usize * cfg.height as usize * cfg.width as usize * dtype_size(&cfg.dtype)
}

/// Runs the preprocess stage for one request.
pub fn preprocess_one(
    ctx: &PipelineContext,
    request: Request,
    stream: Arc<dyn ReplySink>,
) -> Option<PreprocessedItem> {
    if request.end_signal {
        trace!(frontend_id = request.frontend_id, "propagating end-of-stream sentinel");
        return Some(PreprocessedItem {
            request,
            tensor_bytes: bytes::Bytes::new(),
            stream,
        });
    }

    let want = expected_len(&ctx.config.preprocess_config);
    if want != 0 && request.bytes.len() != want {
        trace!(
            filename = %request.filename,
            got = request.bytes.len(),
            want,
            "payload length does not match configured shape; passing through unchanged"
        );
    }

    let tensor_bytes = request.bytes.clone();
    Some(PreprocessedItem {
        request,
        tensor_bytes,
        stream,
    })
}
