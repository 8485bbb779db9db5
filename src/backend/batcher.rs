//! Adaptive batch-size worker (spec §4.6): accumulates items from one
//! recv queue up to the current batch size for its class, then hands the
//! batch to the shared inference worker. The two classes' batch sizes are
//! adjusted together by [`BatchSizes`], fed by the latency measurements
//! every incoming request piggybacks (spec §4.6, §5).
//!
//! Grounded on `original_source/src/backend/backend.cc`'s `Exec()`, which
//! runs this exact state machine before a request is even queued:
//! - Backup currently faster than CDC *and* no reversal has been seen yet
//!   (`first_adjust`): `forwardBatchSize` — additive, `inc_value` moves
//!   from CDC onto Backup, and `first_adjust` stays set (so a run of
//!   consecutive Backup-faster readings keeps nudging by `inc_value` every
//!   time, not just once).
//! - Backup currently faster, but a reversal already happened once
//!   (`!first_adjust`): adjustment is disabled for good
//!   (`setAdjustBatch(false)`) — there is no way back on once this fires.
//! - Backup at or slower than CDC: `backwardBatchSize` — multiplicative,
//!   Backup shrinks by `(1 - dec_value)` and CDC grows by `(1 +
//!   dec_value)`, every single time this branch is taken regardless of
//!   `first_adjust`; the first time it fires it also clears `first_adjust`.
//! Spec §8 scenario 6 exercises exactly the first bullet.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::BackendItem;
use crate::config::BatchConfig;
use crate::message::EncodeClass;
use crate::queue::BoundedQueue;

struct Inner {
    backup: f64,
    cdc: f64,
    first_adjust: bool,
    adjust_enabled: bool,
}

/// The backend-wide adaptive batch-size state: one pair of sizes (Backup,
/// CDC) instead of two independent sizers, since spec §4.6's adjustment
/// rule only ever makes sense as a comparison between the two classes.
/// Sizes are tracked as `f64` internally (truncated to `usize` on read)
/// since the multiplicative branch would otherwise lose all precision
/// after the first adjustment.
pub struct BatchSizes {
    max: usize,
    inc: f64,
    dec: f64,
    auto: bool,
    inner: Mutex<Inner>,
}

impl BatchSizes {
    pub fn new(cfg: &BatchConfig) -> BatchSizes {
        let backup_seed = cfg.batch_size_1.unwrap_or(cfg.batch_size).max(1);
        let cdc_seed = cfg.batch_size_2.unwrap_or(cfg.batch_size).max(1);
        let auto = cfg.mode == "auto";
        BatchSizes {
            max: cfg.max_batch_size.max(backup_seed).max(cdc_seed),
            inc: cfg.inc_value as f64,
            dec: cfg.dec_value,
            auto,
            inner: Mutex::new(Inner {
                backup: backup_seed as f64,
                cdc: cdc_seed as f64,
                first_adjust: true,
                adjust_enabled: auto,
            }),
        }
    }

    pub fn backup_size(&self) -> usize {
        self.inner.lock().backup.round().clamp(1.0, self.max as f64) as usize
    }

    pub fn cdc_size(&self) -> usize {
        self.inner.lock().cdc.round().clamp(1.0, self.max as f64) as usize
    }

    /// Folds one item's piggybacked latency reading into the running batch
    /// sizes. A no-op in `mode: "fixed"`, on a reading with an unmeasured
    /// (`<= 0.0`) side, on an unmeasured `decode_time` (`== 0.0`), or once
    /// a reversal-after-reversal has permanently disabled adjustment.
    pub fn maybe_adjust(&self, cdc_infer_time: f64, backup_infer_time: f64, decode_time: f64) {
        if !self.auto {
            return;
        }
        if cdc_infer_time <= 0.0 || backup_infer_time <= 0.0 || decode_time == 0.0 {
            return;
        }

        let mut inner = self.inner.lock();
        if !inner.adjust_enabled {
            return;
        }

        if backup_infer_time < cdc_infer_time {
            if inner.first_adjust {
                inner.backup = (inner.backup + self.inc).min(self.max as f64);
                inner.cdc = (inner.cdc - self.inc).max(1.0);
            } else {
                inner.adjust_enabled = false;
            }
        } else {
            inner.backup = (inner.backup * (1.0 - self.dec)).clamp(1.0, self.max as f64);
            inner.cdc = (inner.cdc * (1.0 + self.dec)).clamp(1.0, self.max as f64);
            if inner.first_adjust {
                inner.first_adjust = false;
            }
        }
    }
}

/// A read-only view of one class's current batch-size target, so
/// [`run`]'s API stays a single `Arc<T>` regardless of which class it's
/// draining.
pub struct ClassSizeView {
    sizes: Arc<BatchSizes>,
    class: EncodeClass,
}

impl ClassSizeView {
    pub fn new(sizes: Arc<BatchSizes>, class: EncodeClass) -> ClassSizeView {
        ClassSizeView { sizes, class }
    }

    pub fn current(&self) -> usize {
        match self.class {
            EncodeClass::Backup => self.sizes.backup_size(),
            EncodeClass::Cdc => self.sizes.cdc_size(),
        }
    }
}

/// Drains `recv`, accumulating up to `sizes`'s current batch size for this
/// class (or until `recv` briefly runs dry, so a trickle of traffic isn't
/// held hostage waiting to fill a large batch) before pushing to
/// `batch_queue`.
pub fn run(recv: Arc<BoundedQueue<BackendItem>>, batch_queue: Arc<BoundedQueue<Vec<BackendItem>>>, sizes: Arc<ClassSizeView>) {
    loop {
        let first = recv.pop();
        let target = sizes.current();
        let mut batch = Vec::with_capacity(target);
        batch.push(first);

        while batch.len() < target {
            match recv.try_pop() {
                Some(item) => batch.push(item),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    if recv.is_empty() {
                        break;
                    }
                }
            }
        }

        batch_queue.push(batch);
    }
}
