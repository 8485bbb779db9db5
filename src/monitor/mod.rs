//! Vulnerability monitor (spec §4.5): ticks every zone's node state on a
//! query-count or wall-clock trigger, and publishes the eligible-backend
//! sets the dispatcher draws from.
//!
//! Grounded on `original_source/src/frontend/zone.hh`'s `Monitor` (the
//! cross-zone driver around `ZoneState`), generalized per SPEC_FULL §C.1 to
//! cover all four flagging modes named there: `baseline` (no proactive
//! flagging, recovery-only), `passive` (delegated to [`zone::Zone::advance`]),
//! `ldd` ("local drastic drop" — a zone that loses an unusually large
//! fraction of its own nodes in one slice flags itself wholesale), and `fgd`
//! ("fleet-wide drastic drop" — a zone's drop promotes the zone itself
//! wholesale, plus its most historically-correlated peers, found via Pearson
//! correlation over each zone's recent preemption-magnitude history).
//! `cee` ("capacity-expiry-evict", `monitor_config.cee`) is not its own mode
//! but an optional modifier on `fgd`, per `monitor2parts.hh`'s `cee_` flag:
//! every zone `fgd` promotes is also pushed onto a FIFO `volatile_set_`
//! bounded by `node_number/(k+1)` zones; once that bound is hit, the oldest
//! entry is evicted (demoted back to fully invulnerable) to make room.

pub mod predictor;
pub mod zone;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::{Config, Trace};
use crate::errors::{InferflowError, Result};
use crate::message::EncodeClass;
use predictor::{NaivePredictor, Predictor};
use zone::Zone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlaggingMode {
    Baseline,
    Passive,
    Ldd,
    Fgd,
    Arima,
}

impl FlaggingMode {
    fn parse(s: &str) -> Result<FlaggingMode> {
        match s {
            "baseline" => Ok(FlaggingMode::Baseline),
            "passive" => Ok(FlaggingMode::Passive),
            "ldd" => Ok(FlaggingMode::Ldd),
            "fgd" => Ok(FlaggingMode::Fgd),
            "arima" => Ok(FlaggingMode::Arima),
            other => Err(InferflowError::ConfigInvalid(format!(
                "monitor_config.algorithm: unknown value {:?}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateMode {
    Query,
    Time,
}

impl UpdateMode {
    fn parse(s: &str) -> Result<UpdateMode> {
        match s {
            "query" => Ok(UpdateMode::Query),
            "time" => Ok(UpdateMode::Time),
            other => Err(InferflowError::ConfigInvalid(format!(
                "monitor_config.update_mode: unknown value {:?}",
                other
            ))),
        }
    }
}

/// A single candidate backend as the dispatcher sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub ip: String,
    pub region_id: u32,
}

/// Summary of one `tick`, surfaced to the filter's auto-ratio feedback path.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub per_zone_preemption: Vec<u32>,
    pub total_preemption: u32,
}

struct ZoneRuntime {
    zone: Mutex<Zone>,
    trace: Vec<u32>,
    slice: AtomicUsize,
    history: Mutex<VecDeque<u32>>,
}

/// One in-flight query's broken bit, as tracked by [`Monitor::query_state`].
struct QueryRecord {
    sid: u64,
    is_cdc: bool,
    broken: bool,
}

pub struct Monitor {
    zones: Vec<ZoneRuntime>,
    update_mode: UpdateMode,
    update_interval: u32,
    update_time_gap_ms: u64,
    query_counter: AtomicU64,
    algorithm: FlaggingMode,
    to_vul_num: u32,
    top_k: usize,
    history_length: usize,
    predictor: Box<dyn Predictor>,
    /// `monitor_config.cee`: when set, every zone `fgd` promotes is also
    /// pushed onto `volatile_zones`, a FIFO bounded by `volatile_capacity`.
    cee: bool,
    /// Zone indices most recently promoted under `fgd`+`cee`, oldest first.
    volatile_zones: Mutex<VecDeque<usize>>,
    /// `node_number / (k+1)`, per `monitor2parts.hh`'s `volatile_maximum_num_`.
    volatile_capacity: usize,
    /// `(backend ip, qid) -> broken bit`, per spec §4.5's query-state
    /// tracking: populated on dispatch, marked broken on the tick that
    /// first observes the backend going unavailable, discarded when the
    /// reply reader consumes it.
    query_state: Mutex<HashMap<(String, u64), QueryRecord>>,
    /// `sid -> broken bit` for CDC stripes, set alongside the member's own
    /// `query_state` entry so the decode stage can ask about the stripe as
    /// a whole rather than each member individually.
    stripe_state: Mutex<HashMap<u64, bool>>,
}

impl Monitor {
    pub fn new(config: &Config, traces: Vec<Trace>) -> Result<Monitor> {
        if traces.len() != config.backend_ips.len() {
            return Err(InferflowError::ConfigInvalid(format!(
                "monitor: expected {} zone traces, got {}",
                config.backend_ips.len(),
                traces.len()
            )));
        }

        let algorithm = FlaggingMode::parse(&config.monitor_config.algorithm)?;
        let update_mode = UpdateMode::parse(&config.monitor_config.update_mode)?;

        let mut zones = Vec::with_capacity(config.backend_ips.len());
        for (zone_cfg, trace) in config.backend_ips.iter().zip(traces.into_iter()) {
            if trace.data.is_empty() {
                return Err(InferflowError::ConfigInvalid(format!(
                    "zone {} trace is empty",
                    zone_cfg.region_id
                )));
            }
            let zone = Zone::new(
                zone_cfg.ip_list.clone(),
                zone_cfg.region_id,
                config.monitor_config.recovery_time,
                config.monitor_config.to_vul_num,
            );
            zones.push(ZoneRuntime {
                zone: Mutex::new(zone),
                trace: trace.data,
                slice: AtomicUsize::new(zone_cfg.start_time_slice),
                history: Mutex::new(VecDeque::with_capacity(config.monitor_config.history_length)),
            });
        }

        // monitor2parts.hh: `volatile_maximum_num_ = zone_id / (k_+1)`, read
        // here as total node count / (k+1); floored at 1 so an enabled `cee`
        // always has room to track at least the zone that just triggered it.
        let volatile_capacity = ((config.node_number as usize) / (config.k as usize + 1)).max(1);

        Ok(Monitor {
            zones,
            update_mode,
            update_interval: config.monitor_config.update_interval,
            update_time_gap_ms: config.monitor_config.update_time_gap,
            query_counter: AtomicU64::new(0),
            algorithm,
            to_vul_num: config.monitor_config.to_vul_num,
            top_k: config.monitor_config.top_k,
            history_length: config.monitor_config.history_length,
            predictor: Box::new(NaivePredictor),
            cee: config.monitor_config.cee,
            volatile_zones: Mutex::new(VecDeque::new()),
            volatile_capacity,
            query_state: Mutex::new(HashMap::new()),
            stripe_state: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a freshly-dispatched query (spec §4.5 step 1): its broken
    /// bit starts `false`, and for a CDC member its stripe gets a
    /// `stripe_state` entry too (shared across the whole stripe's members,
    /// so the first member to dispatch creates it).
    pub fn register_query(&self, ip: &str, qid: u64, sid: u64, class: EncodeClass) {
        let is_cdc = class == EncodeClass::Cdc;
        self.query_state.lock().insert(
            (ip.to_string(), qid),
            QueryRecord {
                sid,
                is_cdc,
                broken: false,
            },
        );
        if is_cdc {
            self.stripe_state.lock().entry(sid).or_insert(false);
        }
    }

    /// Removes a query's tracking entry and returns its broken bit,
    /// defaulting to `false` for a query the monitor never saw (spec §4.5
    /// step 2, called once the reply reader is done with a query).
    pub fn discard_query(&self, ip: &str, qid: u64) -> bool {
        self.query_state
            .lock()
            .remove(&(ip.to_string(), qid))
            .map(|record| record.broken)
            .unwrap_or(false)
    }

    /// Whether a CDC stripe has been marked broken by a tick since it was
    /// first dispatched.
    pub fn is_stripe_broken(&self, sid: u64) -> bool {
        self.stripe_state.lock().get(&sid).copied().unwrap_or(false)
    }

    /// Drops a stripe's broken-bit entry once its group has closed (answered
    /// or given up), so `stripe_state` doesn't grow without bound.
    pub fn discard_stripe(&self, sid: u64) {
        self.stripe_state.lock().remove(&sid);
    }

    /// Marks every in-flight query against a newly-unavailable backend as
    /// broken, and propagates that to the owning stripe when the query is a
    /// CDC member (spec §4.5: "for every (ip, qid) in query_state with ip in
    /// new_unavailable, set broken = true; if the qid belongs to a CDC
    /// stripe, also set stripe_state[sid] = true").
    fn mark_broken(&self, newly_unavailable: &HashSet<String>) {
        if newly_unavailable.is_empty() {
            return;
        }
        let mut broken_stripes: Vec<u64> = Vec::new();
        {
            let mut query_state = self.query_state.lock();
            for ((ip, _qid), record) in query_state.iter_mut() {
                if newly_unavailable.contains(ip) {
                    record.broken = true;
                    if record.is_cdc {
                        broken_stripes.push(record.sid);
                    }
                }
            }
        }
        if broken_stripes.is_empty() {
            return;
        }
        let mut stripe_state = self.stripe_state.lock();
        for sid in broken_stripes {
            stripe_state.insert(sid, true);
        }
    }

    pub fn is_time_driven(&self) -> bool {
        self.update_mode == UpdateMode::Time
    }

    pub fn update_time_gap_ms(&self) -> u64 {
        self.update_time_gap_ms
    }

    /// Called once per dispatched query in `update_mode: "query"`. Returns
    /// `true` when this call crosses an `update_interval` boundary and the
    /// caller should invoke [`Monitor::tick`].
    pub fn record_query(&self) -> bool {
        if self.update_mode != UpdateMode::Query {
            return false;
        }
        let n = self.query_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_interval != 0 && n % self.update_interval as u64 == 0
    }

    /// Advances every zone by one trace slice. A zone whose trace is
    /// exhausted simply stops advancing (no error — spec_full's resolution
    /// for the "trace exhausted" open question: this is not a
    /// client-visible failure).
    pub fn tick(&self) -> TickReport {
        let passive = matches!(self.algorithm, FlaggingMode::Passive | FlaggingMode::Fgd | FlaggingMode::Ldd);
        let mut per_zone = Vec::with_capacity(self.zones.len());
        let mut newly_unavailable: HashSet<String> = HashSet::new();

        for zr in &self.zones {
            let slice = zr.slice.load(Ordering::Relaxed);
            let Some(&available) = zr.trace.get(slice) else {
                per_zone.push(0);
                continue;
            };
            zr.slice.store(slice + 1, Ordering::Relaxed);

            let preempted = {
                let mut zone = zr.zone.lock();
                zone.advance(available, passive);
                newly_unavailable.extend(zone.new_unavailable_ips());
                zone.preemption_magnitude()
            };
            per_zone.push(preempted);

            let mut history = zr.history.lock();
            history.push_back(preempted);
            while history.len() > self.history_length.max(1) {
                history.pop_front();
            }
        }

        match self.algorithm {
            FlaggingMode::Ldd => self.apply_ldd(&per_zone),
            FlaggingMode::Fgd => self.apply_fgd(&per_zone),
            FlaggingMode::Arima => self.apply_arima(),
            FlaggingMode::Baseline | FlaggingMode::Passive => {}
        }

        self.mark_broken(&newly_unavailable);

        let total: u32 = per_zone.iter().sum();
        TickReport {
            per_zone_preemption: per_zone,
            total_preemption: total,
        }
    }

    /// `ldd`: a zone whose drop this slice is at least double its own
    /// running average flags itself wholesale, on the theory that a single
    /// zone's own recent history is the best predictor of whether this
    /// slice's drop is the start of a wider local outage.
    fn apply_ldd(&self, per_zone: &[u32]) {
        for (zr, &preempted) in self.zones.iter().zip(per_zone.iter()) {
            if preempted == 0 {
                continue;
            }
            let history = zr.history.lock();
            let avg = mean(history.iter().copied());
            drop(history);
            if avg > 0.0 && preempted as f64 >= 2.0 * avg {
                zr.zone.lock().promote_all();
            }
        }
    }

    /// `fgd`: a zone's drop promotes the zone itself wholesale, plus its
    /// `top_k` most Pearson-correlated peers, on the theory that correlated
    /// zones share an underlying cause (a shared power domain, a shared
    /// rack) and will likely drop next. When `cee` is enabled, every zone
    /// promoted here is also pushed onto the `volatile_zones` FIFO.
    fn apply_fgd(&self, per_zone: &[u32]) {
        let histories: Vec<Vec<u32>> = self
            .zones
            .iter()
            .map(|zr| zr.history.lock().iter().copied().collect())
            .collect();

        for (i, &preempted) in per_zone.iter().enumerate() {
            if preempted == 0 {
                continue;
            }
            self.zones[i].zone.lock().promote_all();
            self.track_volatile(i);

            let mut scored: Vec<(usize, f64)> = histories
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(j, h)| (j, pearson_correlation(&histories[i], h)))
                .filter(|(_, score)| score.is_finite())
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            for &(peer, _) in scored.iter().take(self.top_k) {
                self.zones[peer].zone.lock().promote_up_to_public(self.to_vul_num);
                self.track_volatile(peer);
            }
        }
    }

    /// `cee` (`monitor2parts.hh`'s `volatile_set_`/`volatile_maximum_num_`):
    /// pushes a just-promoted zone onto the FIFO, evicting (and demoting
    /// back to fully invulnerable) the oldest tracked zone first if that
    /// would exceed `volatile_capacity`. A no-op unless `cee` is set.
    fn track_volatile(&self, zone_idx: usize) {
        if !self.cee {
            return;
        }
        let mut volatile = self.volatile_zones.lock();
        if volatile.len() >= self.volatile_capacity {
            if let Some(expired) = volatile.pop_front() {
                self.zones[expired].zone.lock().demote_all();
            }
        }
        volatile.push_back(zone_idx);
    }

    /// `arima`: forecast next-slice availability per zone and flag
    /// proactively when the forecast itself signals a drop, via the
    /// pluggable [`Predictor`].
    fn apply_arima(&self) {
        for zr in &self.zones {
            let history: Vec<u32> = zr.history.lock().iter().copied().collect();
            if history.len() < 2 {
                continue;
            }
            if let Some(forecast) = self.predictor.predict_next(&history) {
                let last = *history.last().unwrap();
                if forecast < last {
                    zr.zone.lock().promote_up_to_public(self.to_vul_num);
                }
            }
        }
    }

    pub fn eligible_invulnerable(&self) -> Vec<Backend> {
        self.zones
            .iter()
            .flat_map(|zr| {
                let zone = zr.zone.lock();
                let region_id = zone.region_id;
                zone.available_invulnerable_ips()
                    .into_iter()
                    .map(move |ip| Backend { ip, region_id })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn eligible_vulnerable(&self) -> Vec<Backend> {
        self.zones
            .iter()
            .flat_map(|zr| {
                let zone = zr.zone.lock();
                let region_id = zone.region_id;
                zone.available_vulnerable_ips()
                    .into_iter()
                    .map(move |ip| Backend { ip, region_id })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn all_backends(&self) -> Vec<Backend> {
        self.zones
            .iter()
            .flat_map(|zr| {
                let zone = zr.zone.lock();
                let region_id = zone.region_id;
                zone.all_ips()
                    .iter()
                    .cloned()
                    .map(move |ip| Backend { ip, region_id })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn region_of(&self, ip: &str) -> Option<u32> {
        self.zones.iter().find_map(|zr| {
            let zone = zr.zone.lock();
            zone.all_ips().iter().any(|z| z == ip).then_some(zone.region_id)
        })
    }

    pub fn available_region_count(&self) -> usize {
        self.zones
            .iter()
            .filter(|zr| !zr.zone.lock().available_ips().is_empty())
            .count()
    }
}

fn mean(values: impl Iterator<Item = u32>) -> f64 {
    let values: Vec<f64> = values.map(|v| v as f64).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Pearson correlation coefficient between two equal-or-unequal-length
/// series, computed over their shared (zipped) prefix. Returns `NaN` when
/// either series has zero variance.
fn pearson_correlation(a: &[u32], b: &[u32]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return f64::NAN;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let mean_a = mean(a.iter().copied());
    let mean_b = mean(b.iter().copied());

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] as f64 - mean_a;
        let db = b[i] as f64 - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
