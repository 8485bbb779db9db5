//! Inference worker (spec §4.6): the single thread that actually calls the
//! model server for each assembled batch and forwards per-item results to
//! the reply worker. The adaptive batch-size adjustment itself happens
//! earlier, in [`crate::backend::Backend::recv`], off the latency each
//! incoming request already carries — this worker only logs what it
//! measures.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::backend::{BackendItem, BackendResult, ModelServer};
use crate::queue::BoundedQueue;

pub fn run(
    batch_queue: Arc<BoundedQueue<Vec<BackendItem>>>,
    reply_queue: Arc<BoundedQueue<BackendResult>>,
    model_server: Arc<dyn ModelServer>,
) {
    loop {
        let batch = batch_queue.pop();
        if batch.is_empty() {
            continue;
        }

        let model = batch[0].model.clone();
        let class = batch[0].class;
        let tensors: Vec<bytes::Bytes> = batch.iter().map(|item| item.tensor_bytes.clone()).collect();

        let start = Instant::now();
        let outputs = model_server.infer(&model, &tensors);
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        debug!(batch_size = batch.len(), latency_ms, ?class, "ran inference batch");

        for (item, output) in batch.into_iter().zip(outputs.into_iter()) {
            reply_queue.push(BackendResult {
                qid: item.qid,
                sid: item.sid,
                is_parity: item.is_parity,
                origin: item.origin,
                output,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct EchoServer;
    impl ModelServer for EchoServer {
        fn infer(&self, _model: &str, batch: &[Bytes]) -> Vec<Option<Bytes>> {
            batch.iter().map(|b| Some(b.clone())).collect()
        }
    }

    #[test]
    fn echo_server_produces_one_output_per_input() {
        let server = EchoServer;
        let batch = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let outputs = server.infer("resnet", &batch);
        assert_eq!(outputs, vec![Some(Bytes::from_static(b"a")), Some(Bytes::from_static(b"b"))]);
    }
}
