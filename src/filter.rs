//! Encoding-class selector (spec §4.3).
//!
//! Grounded on `original_source/src/frontend/filter.hh`: a Bernoulli draw
//! between `Backup` and `CDC`, either with a fixed ratio (`manual`) or an
//! auto-tuned ratio `ρ(n,k,f)` derived from the combinatorial balance
//! between surviving backends and parity overhead. The auto path debounces
//! ratio changes the same way the reference does: a changed ratio applies
//! immediately, then further changes are held off for a 10-cycle cool-down.

use parking_lot::Mutex;
use rand::Rng;

use crate::message::EncodeClass;

/// Precomputed binomial coefficients up to `max_n`, matching the
/// reference's `generateCombinations` (a Pascal's-triangle table rather
/// than a closed-form binomial, to avoid overflow on repeated
/// multiplication for the `n` values this system runs at).
fn generate_combinations(max_n: usize) -> Vec<Vec<f64>> {
    let mut c = vec![vec![0.0f64; max_n + 1]; max_n + 1];
    for n in 0..=max_n {
        c[n][0] = 1.0;
        c[n][n] = 1.0;
        for k in 1..n {
            c[n][k] = c[n - 1][k - 1] + c[n - 1][k];
        }
    }
    c
}

/// ρ(n, k, f) = 1 / (1 − C(n−k, f)/C(n, f) − 1/k + 1), per spec §4.3.
fn combinatorial_ratio(combos: &[Vec<f64>], n: usize, k: usize, f: usize) -> f64 {
    if n == 0 || k == 0 || f >= combos.len() || n >= combos.len() {
        return 1.0;
    }
    let c1 = combos[n][f];
    let c2 = if n >= k { combos[n - k][f.min(n - k)] } else { 0.0 };
    let divisor = 1.0 - c2 / c1 - 1.0 / (k as f64) + 1.0;
    if divisor.abs() < 1e-12 {
        return 1.0;
    }
    1.0 / divisor
}

/// Standardizes a pair of values by their shared mean and pooled standard
/// deviation, as the reference's `stdTwoVar` does for the cost-based
/// feedback path (SPEC_FULL §C.3).
fn std_two_var(x1: f64, x2: f64) -> (f64, f64) {
    let avg = (x1 + x2) / 2.0;
    let std_dev = ((x1 - avg).powi(2) + (x2 - avg).powi(2)).sqrt();
    if std_dev.abs() < 1e-12 {
        return (0.0, 0.0);
    }
    ((x1 - avg) / std_dev, (x2 - avg) / std_dev)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackKind {
    Combinatorial,
    Cost,
}

struct State {
    /// Percentage (0-100) chance of choosing CDC, mirroring the original's
    /// integer-percentage Bernoulli draw.
    ratio_pct: f64,
    update_interval: u32,
    update_enabled: bool,
    backup_ratio: f64,
}

pub struct Filter {
    mode: FilterMode,
    feedback: FeedbackKind,
    k: u32,
    node_number: u32,
    backup_num: u32,
    combos: Vec<Vec<f64>>,
    state: Mutex<State>,
}

impl Filter {
    pub fn new(mode: FilterMode, feedback: FeedbackKind, cdc_ratio_pct: f64, k: u32, node_number: u32, backup_num: u32) -> Self {
        Filter {
            mode,
            feedback,
            k,
            node_number,
            backup_num,
            combos: generate_combinations(node_number.max(1) as usize),
            state: Mutex::new(State {
                ratio_pct: cdc_ratio_pct,
                update_interval: 0,
                update_enabled: true,
                backup_ratio: 0.5,
            }),
        }
    }

    /// Chooses an encoding class for a fresh (non-recompute) item. Callers
    /// handle the `recompute` override themselves (spec §4.2.2 step 1: "If
    /// the item carries recompute, class is forced to Backup").
    pub fn pick(&self) -> EncodeClass {
        let ratio_pct = self.state.lock().ratio_pct;
        let roll: f64 = rand::thread_rng().gen_range(1.0..=100.0);
        if roll > ratio_pct {
            EncodeClass::Backup
        } else {
            EncodeClass::Cdc
        }
    }

    /// Recomputes and (if past the cool-down) applies the auto ratio from
    /// the monitor's reported per-slice preemption magnitude `f`. A no-op
    /// in manual mode.
    pub fn update_from_preemption(&self, f: u32) {
        if self.mode != FilterMode::Manual && self.feedback == FeedbackKind::Combinatorial {
            let ratio = combinatorial_ratio(&self.combos, self.node_number as usize, self.k as usize, f as usize);
            self.set_ratio(ratio * 100.0);
        }
    }

    /// Cost-based feedback path (SPEC_FULL §C.3): derives a backup/CDC
    /// ratio from z-scored redundancy cost and recovery time, then folds it
    /// into the same debounced `ratio_pct`.
    pub fn update_cost_feedback(&self, cdc_recovery_time: f64, backup_recovery_time: f64) {
        if self.feedback != FeedbackKind::Cost {
            return;
        }
        let backup_redundancy = self.backup_num as f64;
        let cdc_redundancy = 1.0 / self.k.max(1) as f64;
        let (cdc_redundancy_ndh, _backup_redundancy_ndh) = std_two_var(cdc_redundancy, backup_redundancy);
        let (cdc_recovery_ndh, _backup_recovery_ndh) = std_two_var(cdc_recovery_time, backup_recovery_time);

        let mut state = self.state.lock();
        let denom = backup_redundancy - cdc_redundancy - backup_recovery_time + cdc_recovery_time;
        if denom.abs() > 1e-12 {
            state.backup_ratio = (cdc_recovery_ndh - cdc_redundancy_ndh) / denom;
        }
    }

    fn set_ratio(&self, ratio_pct: f64) {
        let mut state = self.state.lock();
        let last_same = (ratio_pct - state.ratio_pct).abs() < 1e-9;

        if state.update_enabled && !last_same {
            state.ratio_pct = ratio_pct.clamp(0.0, 100.0);
            state.update_interval = 0;
            state.update_enabled = false;
        } else if !state.update_enabled && state.update_interval < 10 {
            state.update_interval += 1;
        } else if !state.update_enabled && state.update_interval == 10 {
            state.ratio_pct = ratio_pct.clamp(0.0, 100.0);
            state.update_interval = 0;
            state.update_enabled = true;
        }
    }

    pub fn current_ratio_pct(&self) -> f64 {
        self.state.lock().ratio_pct
    }
}
