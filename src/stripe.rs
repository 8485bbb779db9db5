//! Stripe/backup-group completion tracker (spec §3, §4.2.3, §4.2.4, §9).
//!
//! A CDC stripe is `k` data queries — each answering a *different* original
//! client request — plus 1 parity query computed from all `k` of their
//! tensors, tolerant of losing any single member: a data member's own reply
//! goes back to its own client the moment it arrives (spec §9's chosen
//! "reply-on-arrival" resolution), and if exactly one member is ultimately
//! lost, [`crate::codec`] can reconstruct it from whichever `k` others
//! survived. A Backup group is 1 data query plus `B` replicas of the *same*
//! request, tolerant of losing any `B` of them: the first success of any
//! member answers the request, and the group is only broken if every member
//! fails.
//!
//! Grounded on spec.md §9's tagged-variant design note ("`StripeState` is a
//! tagged union over CDC/Backup, with a one-way closed transition") and
//! `original_source/src/frontend/Worker.cc`'s three-way split of this same
//! bookkeeping across `SendToClient` (reply-on-arrival), `DecodeWorker::run`
//! (decode-on-single-loss), and the reply-reader's `encode_fail_num`
//! threshold (recompute-on-multi-loss) — folded here into one `record` call
//! per arriving outcome so a caller doesn't have to re-derive slot state
//! from three places. All mutation happens under the tracker's own lock so
//! a qid can be recorded at most once even if a misbehaving backend replies
//! twice for it.

use std::collections::HashSet;

use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
enum SlotStatus {
    Pending,
    Ok(Bytes),
    Failed,
}

enum Inner {
    Cdc { data: Vec<SlotStatus>, parity: SlotStatus },
    Backup { slots: Vec<SlotStatus> },
    Closed,
}

/// What the caller should do after recording one CDC member's outcome.
#[derive(Debug, Clone)]
pub enum CdcEvent {
    /// Nothing actionable yet.
    Pending,
    /// This qid already reported for this stripe; the call was ignored.
    Duplicate,
    /// A data member just arrived successfully: reply to its own client
    /// immediately (spec §9, reply-on-arrival). Carries that member's own
    /// slot index (so the caller can look up which original request it
    /// answers) and its result bytes; does not by itself close the stripe.
    DataReply { slot_index: usize, bytes: Bytes },
    /// All `k` data members have now succeeded (this call's member
    /// completed the set, whether or not it was itself a data success —
    /// e.g. the parity failing last still leaves all-data-done true).
    /// Every data member already replied individually as it arrived; there
    /// is nothing left to send. The stripe is now closed.
    AllDataComplete,
    /// Exactly one of the `k+1` members is unresolved (never arrived, or
    /// arrived but failed) and it is a data member — reconstruct it from
    /// `survivors` and reply under its own slot. The stripe is now closed.
    NeedsDecode { missing_data_slot: usize, survivors: Vec<Bytes> },
    /// Every member has now reported (no one still pending) and two or
    /// more failed: the stripe cannot be recovered. `failed_data_slots`
    /// lists the data members that never got an answer — only those need
    /// recomputing, since any data member that already succeeded already
    /// replied and must not be answered twice. The stripe is now closed.
    NeedsRecompute { failed_data_slots: Vec<usize> },
}

/// What the caller should do after recording one Backup member's outcome.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Pending,
    Duplicate,
    /// The first replica to succeed: reply under the group's original
    /// request. The group is now closed.
    Reply { bytes: Bytes },
    /// Every replica (`1 + backup_num` of them) failed: recompute the
    /// single original request. The group is now closed.
    NeedsRecompute,
}

/// Tracks one stripe or backup group to completion. `sid` is the stripe id
/// issued by [`crate::message::QidAllocator::next_stripe_id`].
pub struct StripeTracker {
    sid: u64,
    inner: Mutex<Inner>,
    replied_qids: Mutex<HashSet<u64>>,
}

impl StripeTracker {
    pub fn new_cdc(sid: u64, k: usize) -> Self {
        StripeTracker {
            sid,
            inner: Mutex::new(Inner::Cdc {
                data: vec![SlotStatus::Pending; k],
                parity: SlotStatus::Pending,
            }),
            replied_qids: Mutex::new(HashSet::with_capacity(k + 1)),
        }
    }

    /// `replica_count` is the total group size, `1 + backup_num`.
    pub fn new_backup(sid: u64, replica_count: usize) -> Self {
        StripeTracker {
            sid,
            inner: Mutex::new(Inner::Backup {
                slots: vec![SlotStatus::Pending; replica_count],
            }),
            replied_qids: Mutex::new(HashSet::with_capacity(replica_count)),
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.lock(), Inner::Closed)
    }

    /// Records one CDC member's outcome. `slot_index` indexes the stripe's
    /// `k` data members (ignored when `is_parity`). `bytes = None` means
    /// the member failed (transport error, or judged broken by the
    /// monitor).
    pub fn record_cdc(&self, qid: u64, is_parity: bool, slot_index: usize, bytes: Option<Bytes>) -> CdcEvent {
        let mut replied = self.replied_qids.lock();
        if !replied.insert(qid) {
            return CdcEvent::Duplicate;
        }
        drop(replied);

        let mut inner = self.inner.lock();
        let Inner::Cdc { data, parity } = &mut *inner else {
            return CdcEvent::Duplicate;
        };

        let this_data_reply = if is_parity {
            *parity = match bytes {
                Some(b) => SlotStatus::Ok(b),
                None => SlotStatus::Failed,
            };
            None
        } else if let Some(slot) = data.get_mut(slot_index) {
            match bytes {
                Some(b) => {
                    *slot = SlotStatus::Ok(b.clone());
                    Some((slot_index, b))
                }
                None => {
                    *slot = SlotStatus::Failed;
                    None
                }
            }
        } else {
            None
        };

        let ok_data_count = data.iter().filter(|s| matches!(s, SlotStatus::Ok(_))).count();
        if ok_data_count == data.len() {
            *inner = Inner::Closed;
            return CdcEvent::AllDataComplete;
        }

        let failed_data: Vec<usize> = data
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, SlotStatus::Failed).then_some(i))
            .collect();
        let parity_failed = matches!(parity, SlotStatus::Failed);
        let parity_pending = matches!(parity, SlotStatus::Pending);
        let data_pending: Vec<usize> = data
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, SlotStatus::Pending).then_some(i))
            .collect();

        let total_unresolved = data_pending.len() + if parity_pending { 1 } else { 0 };
        let total_failed = failed_data.len() + if parity_failed { 1 } else { 0 };

        // Exactly one member (data or parity) is missing/failed and
        // everything else succeeded: if that one member is a data slot, it
        // is reconstructible from the rest.
        if total_unresolved + total_failed == 1 {
            let missing_data_slot = if !failed_data.is_empty() {
                Some(failed_data[0])
            } else if data_pending.len() == 1 && !parity_pending {
                Some(data_pending[0])
            } else {
                None
            };
            if let Some(missing) = missing_data_slot {
                let mut survivors: Vec<Bytes> = data
                    .iter()
                    .filter_map(|s| match s {
                        SlotStatus::Ok(b) => Some(b.clone()),
                        _ => None,
                    })
                    .collect();
                if let SlotStatus::Ok(p) = parity {
                    survivors.push(p.clone());
                }
                *inner = Inner::Closed;
                return CdcEvent::NeedsDecode { missing_data_slot: missing, survivors };
            }
        }

        // Nobody left pending and at least two failed: unrecoverable.
        if total_unresolved == 0 && total_failed >= 2 {
            *inner = Inner::Closed;
            return CdcEvent::NeedsRecompute { failed_data_slots: failed_data };
        }

        match this_data_reply {
            Some((slot_index, bytes)) => CdcEvent::DataReply { slot_index, bytes },
            None => CdcEvent::Pending,
        }
    }

    /// Records one Backup member's outcome. `slot_index` is unused (every
    /// replica is equivalent) but accepted for symmetry with `record_cdc`.
    pub fn record_backup(&self, qid: u64, _slot_index: usize, bytes: Option<Bytes>) -> BackupEvent {
        let mut replied = self.replied_qids.lock();
        if !replied.insert(qid) {
            return BackupEvent::Duplicate;
        }
        drop(replied);

        let mut inner = self.inner.lock();
        let Inner::Backup { slots } = &mut *inner else {
            return BackupEvent::Duplicate;
        };

        let idx = self.next_pending_slot(slots).unwrap_or(0);
        slots[idx] = match bytes {
            Some(b) => SlotStatus::Ok(b),
            None => SlotStatus::Failed,
        };

        if let SlotStatus::Ok(b) = &slots[idx] {
            let bytes = b.clone();
            *inner = Inner::Closed;
            return BackupEvent::Reply { bytes };
        }
        if slots.iter().all(|s| matches!(s, SlotStatus::Failed)) {
            *inner = Inner::Closed;
            return BackupEvent::NeedsRecompute;
        }
        BackupEvent::Pending
    }

    fn next_pending_slot(&self, slots: &[SlotStatus]) -> Option<usize> {
        slots.iter().position(|s| matches!(s, SlotStatus::Pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdc_replies_to_each_data_member_as_it_arrives() {
        let tracker = StripeTracker::new_cdc(1, 3);
        assert!(matches!(
            tracker.record_cdc(10, false, 0, Some(Bytes::from_static(b"a"))),
            CdcEvent::DataReply { slot_index: 0, .. }
        ));
        assert!(matches!(
            tracker.record_cdc(11, false, 1, Some(Bytes::from_static(b"b"))),
            CdcEvent::DataReply { slot_index: 1, .. }
        ));
        assert!(matches!(
            tracker.record_cdc(12, false, 2, Some(Bytes::from_static(b"c"))),
            CdcEvent::AllDataComplete
        ));
        assert!(tracker.is_closed());
    }

    #[test]
    fn cdc_reconstructs_from_parity_after_one_data_loss() {
        let tracker = StripeTracker::new_cdc(2, 3);
        assert!(matches!(
            tracker.record_cdc(20, false, 0, Some(Bytes::from_static(b"a"))),
            CdcEvent::DataReply { slot_index: 0, .. }
        ));
        assert!(matches!(tracker.record_cdc(21, false, 1, None), CdcEvent::Pending));
        match tracker.record_cdc(22, true, 0, Some(Bytes::from_static(b"parity"))) {
            CdcEvent::NeedsDecode { missing_data_slot, survivors } => {
                assert_eq!(missing_data_slot, 1);
                assert_eq!(survivors.len(), 2);
            }
            other => panic!("expected NeedsDecode, got {:?}", other),
        }
    }

    #[test]
    fn cdc_decode_also_fires_when_the_loss_is_still_pending_but_broken() {
        // slot 1's reply hasn't arrived at all yet (still Pending in the
        // tracker); the caller (decode.rs) is the one who asks the monitor
        // whether a still-outstanding slot is broken, then synthesizes a
        // `None` outcome for it to drive this same decode path.
        let tracker = StripeTracker::new_cdc(2, 3);
        tracker.record_cdc(20, false, 0, Some(Bytes::from_static(b"a")));
        tracker.record_cdc(22, true, 0, Some(Bytes::from_static(b"parity")));
        match tracker.record_cdc(21, false, 1, None) {
            CdcEvent::NeedsDecode { missing_data_slot, survivors } => {
                assert_eq!(missing_data_slot, 1);
                assert_eq!(survivors.len(), 2);
            }
            other => panic!("expected NeedsDecode, got {:?}", other),
        }
    }

    #[test]
    fn cdc_is_unrecoverable_after_two_losses_and_recomputes_only_the_unanswered() {
        let tracker = StripeTracker::new_cdc(3, 3);
        assert!(matches!(
            tracker.record_cdc(30, false, 0, Some(Bytes::from_static(b"a"))),
            CdcEvent::DataReply { slot_index: 0, .. }
        ));
        assert!(matches!(tracker.record_cdc(31, false, 1, None), CdcEvent::Pending));
        assert!(matches!(
            tracker.record_cdc(33, false, 2, Some(Bytes::from_static(b"c"))),
            CdcEvent::DataReply { slot_index: 2, .. }
        ));
        match tracker.record_cdc(32, true, 0, None) {
            CdcEvent::NeedsRecompute { failed_data_slots } => {
                assert_eq!(failed_data_slots, vec![1]);
            }
            other => panic!("expected NeedsRecompute, got {:?}", other),
        }
        assert!(tracker.is_closed());
    }

    #[test]
    fn backup_group_completes_on_first_success() {
        let tracker = StripeTracker::new_backup(4, 3);
        assert!(matches!(tracker.record_backup(40, 0, None), BackupEvent::Pending));
        match tracker.record_backup(41, 1, Some(Bytes::from_static(b"r"))) {
            BackupEvent::Reply { bytes } => assert_eq!(bytes, Bytes::from_static(b"r")),
            other => panic!("expected Reply, got {:?}", other),
        }
    }

    #[test]
    fn backup_group_breaks_only_when_every_replica_fails() {
        let tracker = StripeTracker::new_backup(5, 2);
        assert!(matches!(tracker.record_backup(50, 0, None), BackupEvent::Pending));
        match tracker.record_backup(51, 1, None) {
            BackupEvent::NeedsRecompute => {}
            other => panic!("expected NeedsRecompute, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_qid_is_rejected_even_mid_group() {
        let tracker = StripeTracker::new_cdc(6, 3);
        tracker.record_cdc(60, false, 0, Some(Bytes::from_static(b"a")));
        assert!(matches!(
            tracker.record_cdc(60, false, 0, Some(Bytes::from_static(b"a"))),
            CdcEvent::Duplicate
        ));
    }
}
