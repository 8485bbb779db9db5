//! Dispatch stage (spec §4.2.3): picks a diverse backend for every member
//! of a stripe/backup group and hands each one to the transport.
//!
//! Grounded on `original_source/src/frontend/Worker.cc`'s dispatch step and
//! the teacher's `backend/backend.rs` connection-selection pattern, with
//! the actual diversity-aware pick delegated to [`crate::dispatcher::Dispatcher`].
//! A member that fails to even reach a backend (a transport error, or the
//! dispatcher running out of eligible backends) is recorded immediately as
//! a failed outcome — the decode stage treats it exactly like a backend
//! that accepted the query but then failed it.

use std::sync::Arc;

use tracing::warn;

use crate::queue::BoundedQueue;

use super::{EncodedGroup, PipelineContext, QueryOutcome};

pub fn run(ctx: PipelineContext, input: Arc<BoundedQueue<EncodedGroup>>, outcomes: Arc<BoundedQueue<QueryOutcome>>) {
    loop {
        let group = input.pop();
        if group.end_signal {
            outcomes.push(QueryOutcome {
                qid: 0,
                sid: 0,
                class: group.class,
                is_parity: false,
                slot_index: 0,
                client_id: 0,
                recompute: false,
                backend_ip: String::new(),
                stream: group.tracker_stream_placeholder(),
                result: None,
                latency_ms: None,
                end_signal: true,
            });
            continue;
        }

        dispatch_one(&ctx, group, &outcomes);
    }
}

/// Spec §4.5's update trigger fires "every Nth successfully dispatched
/// original (non-parity, non-recompute) query" — ticked here per member
/// right after its own successful send, so a `k`-member CDC stripe advances
/// the counter `k` times (once per data member, never for the parity
/// member), matching `Worker.cc`'s own per-`encode_query` dispatch loop
/// (`if (!(encode_query->is_parity_data_ || encode_query->is_recompute_))`).
fn maybe_wake_monitor(ctx: &PipelineContext) {
    if ctx.monitor.is_time_driven() {
        return;
    }
    if ctx.monitor.record_query() {
        let report = ctx.monitor.tick();
        ctx.filter.update_from_preemption(report.total_preemption);
    }
}

fn dispatch_one(ctx: &PipelineContext, group: EncodedGroup, outcomes: &Arc<BoundedQueue<QueryOutcome>>) {
    let member_is_parity: Vec<bool> = group.members.iter().map(|q| q.is_parity).collect();
    match ctx.dispatcher.pick_group(group.class, &member_is_parity) {
        Ok(backends) => {
            for (slot_index, (mut query, backend)) in group.members.into_iter().zip(backends.into_iter()).enumerate() {
                // Piggyback the frontend's latest latency measurements onto
                // every outgoing query (spec §4.6), so the backend's
                // adaptive batch sizer has a fresh reading to compare
                // against without a side-channel RPC.
                let (cdc_infer_time, backup_infer_time, decode_time) = ctx.latency.snapshot();
                query.cdc_infer_time = cdc_infer_time;
                query.backup_infer_time = backup_infer_time;
                query.decode_time = decode_time;

                ctx.monitor.register_query(&backend.ip, query.qid, query.sid, query.class);
                match ctx.backend_client.send_query(&backend.ip, slot_index, &query) {
                    Ok(()) => {
                        if !query.is_parity && !query.recompute {
                            maybe_wake_monitor(ctx);
                        }
                    }
                    Err(err) => {
                        warn!(backend = %backend.ip, sid = query.sid, error = %err, "failed to dispatch query, recording as failed outcome");
                        outcomes.push(QueryOutcome {
                            qid: query.qid,
                            sid: query.sid,
                            class: query.class,
                            is_parity: query.is_parity,
                            slot_index,
                            client_id: query.client_id,
                            recompute: query.recompute,
                            backend_ip: backend.ip.clone(),
                            stream: query.stream.clone(),
                            result: None,
                            latency_ms: None,
                            end_signal: false,
                        });
                    }
                }
            }
        }
        Err(err) => {
            warn!(sid = group.sid, error = %err, "dispatcher starved, failing every member of the group");
            for (slot_index, query) in group.members.into_iter().enumerate() {
                outcomes.push(QueryOutcome {
                    qid: query.qid,
                    sid: query.sid,
                    class: query.class,
                    is_parity: query.is_parity,
                    slot_index,
                    client_id: query.client_id,
                    recompute: query.recompute,
                    backend_ip: String::new(),
                    stream: query.stream.clone(),
                    result: None,
                    latency_ms: None,
                    end_signal: false,
                });
            }
        }
    }
}

impl EncodedGroup {
    /// The end-of-stream sentinel carries no real member, so the stream it
    /// hands the decode stage is a dummy sink; decode never sends to it
    /// since it checks `end_signal` first.
    fn tracker_stream_placeholder(&self) -> Arc<dyn crate::message::ReplySink> {
        struct NullSink;
        impl crate::message::ReplySink for NullSink {
            fn send_reply(&self, _reply: crate::message::Reply) {}
        }
        Arc::new(NullSink)
    }
}
