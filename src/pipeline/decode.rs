//! Decode stage (spec §4.2.4): folds backend outcomes into each stripe or
//! backup group's tracker, replies to each client as soon as its own answer
//! is known, reconstructs a single lost member via parity when possible,
//! and schedules a recompute when a group is truly unrecoverable.
//!
//! Grounded on `original_source/src/frontend/Worker.cc`'s three-way split
//! of this same bookkeeping: `SendToClient` replies to a CDC data query the
//! moment it arrives rather than waiting on the rest of its stripe;
//! `DecodeWorker::run` reconstructs the one still-missing member once
//! exactly `k` of `k+1` have arrived and the monitor calls the stripe
//! broken; and the reply-reader's `encode_fail_num` threshold recomputes
//! only the data queries recorded as broken once every member has reported
//! and at least two failed — never the ones that already got an answer,
//! since the at-most-one-reply-per-qid invariant (spec §3, §8) would
//! otherwise be violated. [`crate::stripe::StripeTracker`] folds all three
//! branches into the single `record_cdc`/`record_backup` calls below.
//!
//! Every outcome is first checked against [`crate::monitor::Monitor`]'s
//! query-state tracking (spec §4.5): a reply that arrived before the
//! backend was flagged broken is still treated as a failure once the
//! monitor catches up, since the node that produced it may since have been
//! preempted mid-flight.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{error, warn};

use crate::message::{EncodeClass, Reply};
use crate::queue::BoundedQueue;
use crate::stripe::{BackupEvent, CdcEvent};

use super::encode::recompute_request;
use super::{GroupEntry, MemberMeta, PipelineContext, PreprocessedItem, QueryOutcome};

pub fn run(ctx: PipelineContext, outcomes: Arc<BoundedQueue<QueryOutcome>>, input: Arc<BoundedQueue<PreprocessedItem>>) {
    loop {
        let outcome = outcomes.pop();
        if outcome.end_signal {
            continue;
        }
        handle_outcome(&ctx, outcome, &input);
    }
}

fn handle_outcome(ctx: &PipelineContext, outcome: QueryOutcome, input: &Arc<BoundedQueue<PreprocessedItem>>) {
    let entry = {
        let groups = ctx.groups.lock();
        groups.get(&outcome.sid).cloned()
    };
    let Some(entry) = entry else {
        warn!(sid = outcome.sid, qid = outcome.qid, "outcome for unknown or already-closed group");
        return;
    };

    // A query that received a reply before the backend was flagged broken
    // still counts as failed once the monitor catches up (spec §4.5): the
    // broken bit, not just transport success, decides whether this member's
    // result is usable.
    let broken = ctx.monitor.discard_query(&outcome.backend_ip, outcome.qid);
    let effective_result = if broken { None } else { outcome.result };

    // Feed this member's own round-trip time into the frontend's rolling
    // latency view (spec §4.6), regardless of how the outcome itself
    // resolves — a member the monitor later calls broken still measured a
    // real round trip to that backend.
    if let Some(latency_ms) = outcome.latency_ms {
        match outcome.class {
            EncodeClass::Cdc => ctx.latency.update_cdc(latency_ms),
            EncodeClass::Backup => ctx.latency.update_backup(latency_ms),
        }
    }

    match outcome.class {
        EncodeClass::Cdc => handle_cdc_outcome(ctx, &outcome, effective_result, &entry, input),
        EncodeClass::Backup => handle_backup_outcome(ctx, &outcome, effective_result, &entry, input),
    }
}

fn handle_cdc_outcome(
    ctx: &PipelineContext,
    outcome: &QueryOutcome,
    effective_result: Option<Bytes>,
    entry: &Arc<GroupEntry>,
    input: &Arc<BoundedQueue<PreprocessedItem>>,
) {
    let event = entry.tracker.record_cdc(outcome.qid, outcome.is_parity, outcome.slot_index, effective_result);

    match event {
        CdcEvent::Pending | CdcEvent::Duplicate => {}
        CdcEvent::DataReply { slot_index, bytes } => {
            // This member's own answer is known; reply to its own client
            // right away rather than waiting on the rest of the stripe
            // (spec §9, reply-on-arrival).
            if let Some(meta) = entry.members.get(slot_index) {
                meta.stream.send_reply(Reply { id: meta.client_id, reply_info: bytes, recompute: meta.already_recompute });
            }
        }
        CdcEvent::AllDataComplete => {
            ctx.groups.lock().remove(&outcome.sid);
            ctx.monitor.discard_stripe(outcome.sid);
        }
        CdcEvent::NeedsDecode { missing_data_slot, survivors } => {
            ctx.groups.lock().remove(&outcome.sid);
            ctx.monitor.discard_stripe(outcome.sid);
            let Some(meta) = entry.members.get(missing_data_slot) else {
                error!(sid = outcome.sid, missing_data_slot, "decode target has no registered member metadata");
                return;
            };
            let decode_start = Instant::now();
            let decoded = ctx.decoder.decode(&survivors);
            ctx.latency.update_decode(decode_start.elapsed().as_secs_f64() * 1000.0);
            match decoded {
                Ok(recovered) => {
                    meta.stream.send_reply(Reply { id: meta.client_id, reply_info: recovered, recompute: meta.already_recompute });
                }
                Err(err) => {
                    error!(sid = outcome.sid, missing_data_slot, error = %err, "decode failed despite enough survivors, scheduling a recompute");
                    recompute_one(meta, input);
                }
            }
        }
        CdcEvent::NeedsRecompute { failed_data_slots } => {
            ctx.groups.lock().remove(&outcome.sid);
            ctx.monitor.discard_stripe(outcome.sid);
            for slot_index in failed_data_slots {
                let Some(meta) = entry.members.get(slot_index) else { continue };
                if meta.already_recompute {
                    error!(sid = outcome.sid, client_id = meta.client_id, "stripe broken even after recompute, giving up");
                    meta.stream.send_reply(Reply { id: meta.client_id, reply_info: Bytes::new(), recompute: true });
                    continue;
                }
                warn!(sid = outcome.sid, client_id = meta.client_id, slot_index, "stripe unrecoverable, scheduling a recompute");
                recompute_one(meta, input);
            }
        }
    }
}

fn handle_backup_outcome(
    ctx: &PipelineContext,
    outcome: &QueryOutcome,
    effective_result: Option<Bytes>,
    entry: &Arc<GroupEntry>,
    input: &Arc<BoundedQueue<PreprocessedItem>>,
) {
    let event = entry.tracker.record_backup(outcome.qid, outcome.slot_index, effective_result);
    let Some(meta) = entry.members.first() else {
        error!(sid = outcome.sid, "backup group has no registered member metadata");
        return;
    };

    match event {
        BackupEvent::Pending | BackupEvent::Duplicate => {}
        BackupEvent::Reply { bytes } => {
            ctx.groups.lock().remove(&outcome.sid);
            ctx.monitor.discard_stripe(outcome.sid);
            meta.stream.send_reply(Reply { id: meta.client_id, reply_info: bytes, recompute: meta.already_recompute });
        }
        BackupEvent::NeedsRecompute => {
            ctx.groups.lock().remove(&outcome.sid);
            ctx.monitor.discard_stripe(outcome.sid);
            if meta.already_recompute {
                error!(sid = outcome.sid, client_id = meta.client_id, "group broken even after recompute, giving up");
                meta.stream.send_reply(Reply { id: meta.client_id, reply_info: Bytes::new(), recompute: true });
                return;
            }
            warn!(sid = outcome.sid, client_id = meta.client_id, "group broken, scheduling a recompute");
            recompute_one(meta, input);
        }
    }
}

fn recompute_one(meta: &MemberMeta, input: &Arc<BoundedQueue<PreprocessedItem>>) {
    input.push(PreprocessedItem {
        request: recompute_request(meta),
        tensor_bytes: meta.tensor_bytes.clone(),
        stream: meta.stream.clone(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_decoder, build_encoder, Encoder};
    use crate::config::Config;
    use crate::dispatcher::{Dispatcher, SelectionMode};
    use crate::filter::{FeedbackKind, Filter, FilterMode};
    use crate::message::{ChannelReplySink, QidAllocator};
    use crate::monitor::Monitor;
    use crate::pipeline::BackendClient;
    use crate::stripe::StripeTracker;
    use std::collections::HashMap;

    struct NoopBackend;
    impl BackendClient for NoopBackend {
        fn send_query(&self, _backend_ip: &str, _slot_index: usize, _query: &crate::message::Query) -> crate::errors::Result<()> {
            Ok(())
        }
    }

    fn test_context() -> PipelineContext {
        let json = r#"{
            "node_number": 3,
            "k": 2,
            "encode_config": {"backup_num": 2, "encoder_type": "linear"},
            "decode_config": {"decoder_type": "linear"},
            "triton_config": {"scale": "NONE", "model": "resnet"},
            "preprocess_config": {"format": "NHWC", "dtype": "uint8", "channel": 0, "height": 0, "width": 0},
            "filter_config": {"type": "manual", "cdc_ratio": 100},
            "batch_config": {"mode": "fixed", "batch_size": 4},
            "backend_ips": [{"trace": "z0", "region_id": 0, "ip_list": ["10.0.0.0","10.0.0.1","10.0.0.2"]}],
            "monitor_config": {"update_mode": "query", "update_interval": 1000, "algorithm": "baseline", "recovery_time": 1000, "to_vul_num": 0},
            "cache_config": {"strategy": "lru", "use_cache": true, "capacity": 4}
        }"#;
        let config = Arc::new(Config::from_json_str(json).unwrap());
        let monitor = Arc::new(Monitor::new(&config, vec![crate::config::Trace { data: vec![3, 3] }]).unwrap());
        PipelineContext {
            filter: Arc::new(Filter::new(FilterMode::Manual, FeedbackKind::Combinatorial, 100.0, 2, 3, 2)),
            dispatcher: Arc::new(Dispatcher::new(monitor.clone(), SelectionMode::Uniform, 1.0, 1.0)),
            monitor,
            encoder: Arc::from(build_encoder("linear").unwrap()),
            decoder: Arc::from(build_decoder("linear", false, 0, None).unwrap()),
            qids: Arc::new(QidAllocator::new()),
            backend_client: Arc::new(NoopBackend),
            groups: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            latency: Arc::new(crate::pipeline::LatencyStats::new()),
            config,
        }
    }

    fn stream_pair() -> (Arc<dyn crate::message::ReplySink>, tokio::sync::mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Arc::new(ChannelReplySink { tx }), rx)
    }

    fn cdc_meta(stream: Arc<dyn crate::message::ReplySink>, client_id: u64) -> MemberMeta {
        MemberMeta {
            stream,
            client_id,
            tensor_bytes: Bytes::from_static(b"orig"),
            model: "resnet".into(),
            scale: "NONE".into(),
            filename: "x.jpg".into(),
            frontend_id: 0,
            already_recompute: false,
        }
    }

    struct NullSink;
    impl crate::message::ReplySink for NullSink {
        fn send_reply(&self, _reply: Reply) {}
    }

    #[test]
    fn each_cdc_data_member_replies_to_its_own_client_on_arrival() {
        let ctx = test_context();
        let sid = 100;
        let tracker = Arc::new(StripeTracker::new_cdc(sid, 2));
        let (stream_a, mut rx_a) = stream_pair();
        let (stream_b, mut rx_b) = stream_pair();
        ctx.groups.lock().insert(
            sid,
            Arc::new(GroupEntry { tracker, members: vec![cdc_meta(stream_a, 9), cdc_meta(stream_b, 10)] }),
        );
        let input = Arc::new(BoundedQueue::unbounded());

        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 1,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 0,
                client_id: 9,
                recompute: false,
                backend_ip: "10.0.0.0".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"a")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        let reply_a = rx_a.try_recv().unwrap();
        assert_eq!(reply_a.id, 9);
        assert_eq!(reply_a.reply_info, Bytes::from_static(b"a"));
        assert!(rx_b.try_recv().is_err());
        // Still open: only one of two data members has answered.
        assert!(ctx.groups.lock().contains_key(&sid));

        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 2,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 1,
                client_id: 10,
                recompute: false,
                backend_ip: "10.0.0.1".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"b")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        let reply_b = rx_b.try_recv().unwrap();
        assert_eq!(reply_b.id, 10);
        assert!(!ctx.groups.lock().contains_key(&sid));
    }

    #[test]
    fn single_lost_data_member_is_reconstructed_from_parity_and_replied_under_its_own_id() {
        let ctx = test_context();
        let sid = 200;
        let tracker = Arc::new(StripeTracker::new_cdc(sid, 2));
        let (stream_a, mut rx_a) = stream_pair();
        let (stream_b, mut rx_b) = stream_pair();
        ctx.groups.lock().insert(
            sid,
            Arc::new(GroupEntry { tracker, members: vec![cdc_meta(stream_a, 9), cdc_meta(stream_b, 10)] }),
        );
        let input = Arc::new(BoundedQueue::unbounded());

        // Slot 0 succeeds.
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 1,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 0,
                client_id: 9,
                recompute: false,
                backend_ip: "10.0.0.0".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"aaaaaaaa")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        rx_a.try_recv().unwrap();

        // Slot 1 (client 10) fails outright.
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 2,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 1,
                client_id: 10,
                recompute: false,
                backend_ip: "10.0.0.1".into(),
                stream: Arc::new(NullSink),
                result: None,
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        assert!(rx_b.try_recv().is_err());

        // Parity arrives: exactly one loss remains, so it gets reconstructed
        // and replied under client 10's own stream.
        let encoder = crate::codec::LinearEncoder;
        let parity = encoder.encode(&[Bytes::from_static(b"aaaaaaaa"), Bytes::from_static(b"bbbbbbbb")]);
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 3,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: true,
                slot_index: 0,
                client_id: 0,
                recompute: false,
                backend_ip: "10.0.0.2".into(),
                stream: Arc::new(NullSink),
                result: Some(parity),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        let reply_b = rx_b.try_recv().unwrap();
        assert_eq!(reply_b.id, 10);
        assert_eq!(reply_b.reply_info, Bytes::from_static(b"bbbbbbbb"));
        assert!(!ctx.groups.lock().contains_key(&sid));
    }

    #[test]
    fn two_losses_recomputes_only_the_unanswered_member() {
        let ctx = test_context();
        let sid = 300;
        let tracker = Arc::new(StripeTracker::new_cdc(sid, 2));
        let (stream_a, mut rx_a) = stream_pair();
        let (stream_b, _rx_b) = stream_pair();
        ctx.groups.lock().insert(
            sid,
            Arc::new(GroupEntry { tracker, members: vec![cdc_meta(stream_a, 9), cdc_meta(stream_b, 10)] }),
        );
        let input: Arc<BoundedQueue<PreprocessedItem>> = Arc::new(BoundedQueue::unbounded());

        // Slot 0 succeeds and replies right away.
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 1,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 0,
                client_id: 9,
                recompute: false,
                backend_ip: "10.0.0.0".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"a")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        rx_a.try_recv().unwrap();

        // Slot 1 fails.
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 2,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 1,
                client_id: 10,
                recompute: false,
                backend_ip: "10.0.0.1".into(),
                stream: Arc::new(NullSink),
                result: None,
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        // Parity also fails: two losses total, unrecoverable.
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 3,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: true,
                slot_index: 0,
                client_id: 0,
                recompute: false,
                backend_ip: "10.0.0.2".into(),
                stream: Arc::new(NullSink),
                result: None,
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );

        // Only client 10's slot gets recomputed — client 9 already got its
        // reply and must not be answered (or recomputed) again.
        assert_eq!(input.size(), 1);
        let requeued = input.pop();
        assert!(requeued.request.recompute);
        assert_eq!(requeued.request.id, 10);
    }

    #[test]
    fn backup_group_answers_on_first_success() {
        let ctx = test_context();
        let sid = 400;
        let tracker = Arc::new(StripeTracker::new_backup(sid, 2));
        let (stream, mut rx) = stream_pair();
        ctx.groups.lock().insert(sid, Arc::new(GroupEntry { tracker, members: vec![cdc_meta(stream, 9)] }));
        let input = Arc::new(BoundedQueue::unbounded());

        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 1,
                sid,
                class: crate::message::EncodeClass::Backup,
                is_parity: false,
                slot_index: 0,
                client_id: 9,
                recompute: false,
                backend_ip: "10.0.0.0".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"ok")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.id, 9);
        assert!(!ctx.groups.lock().contains_key(&sid));
    }

    #[test]
    fn broken_bit_overrides_a_successful_transport_result() {
        let mut ctx = test_context();
        // test_context()'s own trace never drops a node; swap in a fresh
        // monitor whose trace drops to 1 available on the second slice,
        // FIFO-evicting both 10.0.0.0 and 10.0.0.1, so both members' "reply
        // arrived successfully" outcomes get overridden by the broken bit.
        let monitor = Arc::new(
            crate::monitor::Monitor::new(&ctx.config, vec![crate::config::Trace { data: vec![3, 1] }]).unwrap(),
        );
        ctx.monitor = monitor;

        let sid = 500;
        let tracker = Arc::new(StripeTracker::new_cdc(sid, 2));
        let (stream_a, _rx_a) = stream_pair();
        let (stream_b, _rx_b) = stream_pair();
        ctx.groups.lock().insert(
            sid,
            Arc::new(GroupEntry { tracker, members: vec![cdc_meta(stream_a, 9), cdc_meta(stream_b, 10)] }),
        );
        let input: Arc<BoundedQueue<PreprocessedItem>> = Arc::new(BoundedQueue::unbounded());

        ctx.monitor.register_query("10.0.0.0", 1, sid, crate::message::EncodeClass::Cdc);
        ctx.monitor.register_query("10.0.0.1", 2, sid, crate::message::EncodeClass::Cdc);
        ctx.monitor.tick();
        ctx.monitor.tick();

        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 1,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 0,
                client_id: 9,
                recompute: false,
                backend_ip: "10.0.0.0".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"a")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );
        handle_outcome(
            &ctx,
            QueryOutcome {
                qid: 2,
                sid,
                class: crate::message::EncodeClass::Cdc,
                is_parity: false,
                slot_index: 1,
                client_id: 10,
                recompute: false,
                backend_ip: "10.0.0.1".into(),
                stream: Arc::new(NullSink),
                result: Some(Bytes::from_static(b"b")),
                latency_ms: Some(5.0),
                end_signal: false,
            },
            &input,
        );

        // Both members "succeeded" at the transport level, but both their
        // backends were marked broken by the monitor before their outcomes
        // were handled, so both are treated as failed — two losses on a k=2
        // stripe is unrecoverable, and both unanswered slots recompute.
        assert_eq!(input.size(), 2);
    }
}
