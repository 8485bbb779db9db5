//! Encode stage (spec §4.2.2): groups requests into a CDC stripe or a
//! Backup fan-out and hands the group to dispatch.
//!
//! Grounded on `original_source/src/frontend/Worker.cc`'s `EncodeWorker::run`,
//! which accumulates `k` distinct `SingleQuery`s (each its own client's
//! request) before calling `encoder_->encode` to produce one parity buffer
//! under a fresh id — not a split of one request's tensor into fragments.
//! `encoder.hh`'s signature (`k` input buffers in, one parity buffer out)
//! confirms the same shape. The class choice itself is
//! [`crate::filter::Filter::pick`], except a `recompute` item always keeps
//! (or is forced to) `Backup`, per spec §4.2.2 step 1, since re-encoding a
//! stripe on retry would need `k` fresh peers and the simpler, safer retry
//! path is a plain backup fan-out of the one request that needs redoing.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::message::{EncodeClass, Query, Request};
use crate::queue::BoundedQueue;
use crate::stripe::StripeTracker;

use super::{EncodedGroup, GroupEntry, MemberMeta, PipelineContext, PreprocessedItem};

/// Drives the encode stage. CDC items accumulate in `cdc_buffer` across
/// loop iterations — a stripe only forms once `k` distinct requests have
/// picked the CDC class — while Backup items (and recomputes) are encoded
/// and forwarded one at a time.
pub fn run(ctx: PipelineContext, input: Arc<BoundedQueue<PreprocessedItem>>, output: Arc<BoundedQueue<EncodedGroup>>) {
    let k = ctx.config.k as usize;
    let mut cdc_buffer: Vec<PreprocessedItem> = Vec::with_capacity(k);

    loop {
        let item = input.pop();
        if item.request.end_signal {
            // spec §4.2.2 step 4: a client stream closing with CDC members
            // still buffered (not yet enough peers to fill a stripe) must
            // not strand those requests unanswered — flush each as its own
            // Backup group before propagating the sentinel.
            for leftover in cdc_buffer.drain(..) {
                trace!(
                    frontend_id = leftover.request.frontend_id,
                    client_id = leftover.request.id,
                    "flushing incomplete CDC buffer as a Backup fan-out on stream close"
                );
                output.push(encode_backup(&ctx, leftover));
            }
            output.push(end_signal_group(item.request.frontend_id));
            continue;
        }

        let class = if item.request.recompute {
            EncodeClass::Backup
        } else {
            ctx.filter.pick()
        };

        match class {
            EncodeClass::Backup => output.push(encode_backup(&ctx, item)),
            EncodeClass::Cdc => {
                cdc_buffer.push(item);
                if cdc_buffer.len() == k {
                    let items = std::mem::replace(&mut cdc_buffer, Vec::with_capacity(k));
                    output.push(encode_cdc(&ctx, items));
                }
            }
        }
    }
}

fn end_signal_group(frontend_id: u32) -> EncodedGroup {
    EncodedGroup {
        sid: 0,
        class: EncodeClass::Backup,
        tracker: Arc::new(StripeTracker::new_backup(0, 1)),
        members: vec![Query {
            qid: 0,
            sid: 0,
            class: EncodeClass::Backup,
            is_parity: false,
            model: String::new(),
            scale: String::new(),
            filename: String::new(),
            tensor_bytes: None,
            stream: Arc::new(NullSink),
            front_id: frontend_id,
            recompute: false,
            end_signal: true,
            client_id: 0,
            cdc_infer_time: 0.0,
            backup_infer_time: 0.0,
            decode_time: 0.0,
        }],
        end_signal: true,
    }
}

struct NullSink;
impl crate::message::ReplySink for NullSink {
    fn send_reply(&self, _reply: crate::message::Reply) {}
}

/// Builds one CDC stripe out of `k` distinct, already-accumulated requests:
/// computes the parity tensor over all `k` of their payloads, assigns each
/// a data slot, and registers the stripe's per-member metadata so the
/// decode stage can answer (or recompute) each one under its own identity.
fn encode_cdc(ctx: &PipelineContext, items: Vec<PreprocessedItem>) -> EncodedGroup {
    let k = items.len();
    let sid = ctx.qids.next_stripe_id();
    let tracker = Arc::new(StripeTracker::new_cdc(sid, k));

    let tensors: Vec<Bytes> = items.iter().map(|item| item.tensor_bytes.clone()).collect();
    let parity_bytes = ctx.encoder.encode(&tensors);

    let mut member_metas = Vec::with_capacity(k);
    let mut members = Vec::with_capacity(k + 1);
    let mut parity_model = String::new();
    let mut parity_scale = String::new();
    let mut parity_frontend_id = 0u32;

    for (slot_index, item) in items.into_iter().enumerate() {
        let PreprocessedItem { request, tensor_bytes, stream } = item;
        if slot_index == 0 {
            parity_model = request.model.clone();
            parity_scale = request.scale.clone();
            parity_frontend_id = request.frontend_id;
        }
        member_metas.push(MemberMeta {
            stream: stream.clone(),
            client_id: request.id,
            tensor_bytes: tensor_bytes.clone(),
            model: request.model.clone(),
            scale: request.scale.clone(),
            filename: request.filename.clone(),
            frontend_id: request.frontend_id,
            already_recompute: request.recompute,
        });
        members.push(Query {
            qid: ctx.qids.next_data_qid(),
            sid,
            class: EncodeClass::Cdc,
            is_parity: false,
            model: request.model,
            scale: request.scale,
            filename: request.filename,
            tensor_bytes: Some(tensor_bytes),
            stream,
            front_id: request.frontend_id,
            recompute: request.recompute,
            end_signal: false,
            client_id: request.id,
            cdc_infer_time: 0.0,
            backup_infer_time: 0.0,
            decode_time: 0.0,
        });
    }

    // The parity member belongs to no single client — it only ever feeds
    // reconstruction for whichever one data member is lost — so it carries
    // a dead-end stream and client id 0; decode never replies under it.
    members.push(Query {
        qid: ctx.qids.next_parity_qid(),
        sid,
        class: EncodeClass::Cdc,
        is_parity: true,
        model: parity_model,
        scale: parity_scale,
        filename: String::new(),
        tensor_bytes: Some(parity_bytes),
        stream: Arc::new(NullSink),
        front_id: parity_frontend_id,
        recompute: false,
        end_signal: false,
        client_id: 0,
        cdc_infer_time: 0.0,
        backup_infer_time: 0.0,
        decode_time: 0.0,
    });

    ctx.groups.lock().insert(sid, Arc::new(GroupEntry { tracker: tracker.clone(), members: member_metas }));

    trace!(sid, k, "encoded CDC stripe from k distinct requests");
    EncodedGroup { sid, class: EncodeClass::Cdc, tracker, members, end_signal: false }
}

/// Builds one Backup group (`1 + backup_num` replicas of a single original
/// request).
fn encode_backup(ctx: &PipelineContext, item: PreprocessedItem) -> EncodedGroup {
    let PreprocessedItem { request, tensor_bytes, stream } = item;
    let sid = ctx.qids.next_stripe_id();
    let replica_count = 1 + ctx.config.encode_config.backup_num as usize;
    let tracker = Arc::new(StripeTracker::new_backup(sid, replica_count));

    ctx.groups.lock().insert(
        sid,
        Arc::new(GroupEntry {
            tracker: tracker.clone(),
            members: vec![MemberMeta {
                stream: stream.clone(),
                client_id: request.id,
                tensor_bytes: tensor_bytes.clone(),
                model: request.model.clone(),
                scale: request.scale.clone(),
                filename: request.filename.clone(),
                frontend_id: request.frontend_id,
                already_recompute: request.recompute,
            }],
        }),
    );

    let members: Vec<Query> = (0..replica_count)
        .map(|_| Query {
            qid: ctx.qids.next_data_qid(),
            sid,
            class: EncodeClass::Backup,
            is_parity: false,
            model: request.model.clone(),
            scale: request.scale.clone(),
            filename: request.filename.clone(),
            tensor_bytes: Some(tensor_bytes.clone()),
            stream: stream.clone(),
            front_id: request.frontend_id,
            recompute: request.recompute,
            end_signal: false,
            client_id: request.id,
            cdc_infer_time: 0.0,
            backup_infer_time: 0.0,
            decode_time: 0.0,
        })
        .collect();

    trace!(sid, replica_count, "encoded Backup group");
    EncodedGroup { sid, class: EncodeClass::Backup, tracker, members, end_signal: false }
}

/// Builds the fresh `Request`/`PreprocessedItem` a decode-triggered
/// recompute resubmits through the front of the pipeline, reusing one
/// member's own original payload rather than the whole group's.
pub fn recompute_request(meta: &MemberMeta) -> Request {
    Request {
        id: meta.client_id,
        model: meta.model.clone(),
        scale: meta.scale.clone(),
        filename: meta.filename.clone(),
        bytes: meta.tensor_bytes.clone(),
        end_signal: false,
        recompute: true,
        frontend_id: meta.frontend_id,
    }
}
