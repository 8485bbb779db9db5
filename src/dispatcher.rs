//! Backend selection for a stripe or backup group (spec §4.4).
//!
//! Grounded on `original_source/src/frontend/zone.hh`'s weighted draws and
//! spec.md §4.4's candidate-pool-polarity rule: a CDC data query prefers the
//! invulnerable pool (falling back to vulnerable, then every known backend);
//! a CDC parity query prefers the opposite order, since it only matters if a
//! data slot is lost and pairing it with the same failure-prone pool the
//! data slots avoid spreads risk rather than concentrating it. A Backup
//! group draws from the combined invulnerable+vulnerable pool for every
//! member. An IP is never reused within a group regardless of class; a
//! region is never reused either, but only for Backup groups and only when
//! more than one region currently has any available node — forcing a CDC
//! stripe's k+1 members into the same region would starve it needlessly
//! whenever the fleet has shrunk to one live region, while a Backup group's
//! whole purpose is surviving a region-wide loss. The default `uniform`
//! selection mode draws evenly from the eligible pool; the alternate
//! `weighted` mode (SPEC_FULL §C.2) biases toward the head of the
//! invulnerable pool using the same exponential weighting
//! [`crate::monitor::zone::Zone`] uses internally, steered by
//! `monitor_config.eta_1`/`eta_2`.

use std::collections::HashSet;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::errors::{InferflowError, Result};
use crate::message::EncodeClass;
use crate::monitor::{Backend, Monitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Uniform,
    Weighted,
}

impl SelectionMode {
    pub fn parse(s: &str) -> SelectionMode {
        match s {
            "weighted" => SelectionMode::Weighted,
            _ => SelectionMode::Uniform,
        }
    }
}

pub struct Dispatcher {
    monitor: Arc<Monitor>,
    selection: SelectionMode,
    eta_1: f64,
    eta_2: f64,
}

impl Dispatcher {
    pub fn new(monitor: Arc<Monitor>, selection: SelectionMode, eta_1: f64, eta_2: f64) -> Self {
        Dispatcher {
            monitor,
            selection,
            eta_1,
            eta_2,
        }
    }

    /// Picks one backend per entry of `member_is_parity` for one stripe/
    /// backup group, never repeating an IP within the group. `member_is_parity`
    /// is empty-meaning-data for `EncodeClass::Backup` (the flag is only
    /// meaningful for CDC). Each member widens its candidate pool in stages
    /// per its own class/polarity before giving up, per §7's softened
    /// starvation handling.
    pub fn pick_group(&self, class: EncodeClass, member_is_parity: &[bool]) -> Result<Vec<Backend>> {
        let mut chosen_ips: HashSet<String> = HashSet::with_capacity(member_is_parity.len());
        let mut chosen_regions: HashSet<u32> = HashSet::with_capacity(member_is_parity.len());
        let mut picks: Vec<Backend> = Vec::with_capacity(member_is_parity.len());

        let region_diversity = class == EncodeClass::Backup && self.monitor.available_region_count() > 1;

        for &is_parity in member_is_parity {
            let stages = self.stage_order(class, is_parity);

            let backend = self
                .pick_one(&stages, &chosen_ips, if region_diversity { Some(&chosen_regions) } else { None })
                .or_else(|| {
                    // Region-diversity starved the strict pass; relax it
                    // rather than fail the whole group outright.
                    if region_diversity {
                        self.pick_one(&stages, &chosen_ips, None)
                    } else {
                        None
                    }
                });

            match backend {
                Some(backend) => {
                    chosen_ips.insert(backend.ip.clone());
                    chosen_regions.insert(backend.region_id);
                    picks.push(backend);
                }
                None => return Err(InferflowError::DispatcherStarvation { class }),
            }
        }

        Ok(picks)
    }

    /// The candidate-pool preference order for one member, widest pool last.
    fn stage_order(&self, class: EncodeClass, is_parity: bool) -> Vec<Vec<Backend>> {
        match class {
            EncodeClass::Cdc if !is_parity => vec![
                self.monitor.eligible_invulnerable(),
                self.monitor.eligible_vulnerable(),
                self.monitor.all_backends(),
            ],
            EncodeClass::Cdc => vec![
                self.monitor.eligible_vulnerable(),
                self.monitor.eligible_invulnerable(),
                self.monitor.all_backends(),
            ],
            EncodeClass::Backup => {
                let mut combined = self.monitor.eligible_invulnerable();
                combined.extend(self.monitor.eligible_vulnerable());
                vec![combined, self.monitor.all_backends()]
            }
        }
    }

    /// Takes the first pool (in stage order) with a surviving candidate
    /// after excluding already-chosen IPs (and, when `chosen_regions` is
    /// `Some`, already-chosen regions), shuffled or weight-sorted per
    /// `self.selection`.
    fn pick_one(&self, stages: &[Vec<Backend>], chosen_ips: &HashSet<String>, chosen_regions: Option<&HashSet<u32>>) -> Option<Backend> {
        for pool in stages {
            let mut candidates: Vec<Backend> = pool
                .iter()
                .filter(|b| !chosen_ips.contains(&b.ip))
                .filter(|b| chosen_regions.map_or(true, |regions| !regions.contains(&b.region_id)))
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            match self.selection {
                SelectionMode::Uniform => candidates.shuffle(&mut rand::thread_rng()),
                SelectionMode::Weighted => self.weight_sort(&mut candidates),
            }
            return candidates.into_iter().next();
        }
        None
    }

    /// Orders `pool` so that earlier entries are more likely to be taken
    /// first — an exponential-decay bias on position, matching
    /// `Zone::weighted_decrease`'s shape but applied across the whole pool
    /// rather than within a single zone.
    fn weight_sort(&self, pool: &mut [Backend]) {
        let alpha = if self.eta_1 > 0.0 { self.eta_1 } else { self.eta_2 };
        let mut rng = rand::thread_rng();
        let mut scored: Vec<(f64, usize)> = pool
            .iter()
            .enumerate()
            .map(|(i, _)| {
                use rand::Rng;
                let jitter: f64 = rng.gen_range(0.0..1.0);
                ((-alpha * i as f64).exp() + jitter * 1e-6, i)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let ordered: Vec<Backend> = scored.into_iter().map(|(_, i)| pool[i].clone()).collect();
        pool.clone_from_slice(&ordered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Trace};

    fn sample_config() -> Config {
        let json = r#"{
            "node_number": 6,
            "k": 2,
            "encode_config": {"backup_num": 2, "encoder_type": "linear"},
            "decode_config": {"decoder_type": "linear"},
            "triton_config": {"scale": "NONE", "model": "resnet"},
            "preprocess_config": {"format": "NHWC", "dtype": "uint8", "channel": 3, "height": 8, "width": 8},
            "filter_config": {"type": "manual", "cdc_ratio": 100},
            "batch_config": {"mode": "fixed", "batch_size": 4},
            "backend_ips": [
                {"trace": "z0", "region_id": 0, "ip_list": ["10.0.0.0","10.0.0.1","10.0.0.2"]},
                {"trace": "z1", "region_id": 1, "ip_list": ["10.0.1.0","10.0.1.1","10.0.1.2"]}
            ],
            "monitor_config": {"update_mode": "query", "update_interval": 1000000, "algorithm": "baseline", "recovery_time": 1000, "to_vul_num": 0, "top_k": 1, "history_length": 4},
            "cache_config": {"strategy": "lru", "use_cache": false, "capacity": 4}
        }"#;
        Config::from_json_str(json).unwrap()
    }

    fn sample_traces() -> Vec<Trace> {
        vec![Trace { data: vec![3, 3, 3] }, Trace { data: vec![3, 3, 3] }]
    }

    #[test]
    fn cdc_members_never_reuse_an_ip() {
        let cfg = sample_config();
        let monitor = Arc::new(Monitor::new(&cfg, sample_traces()).unwrap());
        let dispatcher = Dispatcher::new(monitor, SelectionMode::Uniform, 1.0, 1.0);

        // k=2 data members + 1 parity; CDC groups don't need distinct
        // regions, only distinct IPs.
        let picks = dispatcher.pick_group(EncodeClass::Cdc, &[false, false, true]).unwrap();
        assert_eq!(picks.len(), 3);
        let ips: HashSet<&str> = picks.iter().map(|b| b.ip.as_str()).collect();
        assert_eq!(ips.len(), 3);
    }

    #[test]
    fn cdc_parity_member_prefers_the_vulnerable_pool() {
        let cfg = sample_config();
        let monitor = Arc::new(Monitor::new(&cfg, sample_traces()).unwrap());
        let dispatcher = Dispatcher::new(monitor, SelectionMode::Uniform, 1.0, 1.0);

        // Every zone seeds exactly one vulnerable node on construction
        // (10.0.0.0 and 10.0.1.0 here); a lone parity member should be
        // drawn from that pool before falling back to invulnerable.
        let picks = dispatcher.pick_group(EncodeClass::Cdc, &[true]).unwrap();
        assert_eq!(picks.len(), 1);
        assert!(picks[0].ip == "10.0.0.0" || picks[0].ip == "10.0.1.0");
    }

    #[test]
    fn backup_group_enforces_region_diversity_when_more_than_one_region_is_available() {
        let cfg = sample_config();
        let monitor = Arc::new(Monitor::new(&cfg, sample_traces()).unwrap());
        let dispatcher = Dispatcher::new(monitor, SelectionMode::Uniform, 1.0, 1.0);

        let picks = dispatcher.pick_group(EncodeClass::Backup, &[false, false]).unwrap();
        assert_eq!(picks.len(), 2);
        assert_ne!(picks[0].ip, picks[1].ip);
        assert_ne!(picks[0].region_id, picks[1].region_id);
    }

    #[test]
    fn starves_when_group_size_exceeds_total_backend_count() {
        let cfg = sample_config();
        let monitor = Arc::new(Monitor::new(&cfg, sample_traces()).unwrap());
        let dispatcher = Dispatcher::new(monitor, SelectionMode::Uniform, 1.0, 1.0);

        // Only 6 backends exist in total; a 7-member group can never get
        // distinct IPs for every member no matter how the pools widen.
        let err = dispatcher.pick_group(EncodeClass::Backup, &[false; 7]).unwrap_err();
        assert!(matches!(err, InferflowError::DispatcherStarvation { .. }));
    }

    #[test]
    fn weighted_mode_still_respects_ip_diversity() {
        let cfg = sample_config();
        let monitor = Arc::new(Monitor::new(&cfg, sample_traces()).unwrap());
        let dispatcher = Dispatcher::new(monitor, SelectionMode::Weighted, 0.5, 0.5);

        let picks = dispatcher.pick_group(EncodeClass::Cdc, &[false, false]).unwrap();
        assert_eq!(picks.len(), 2);
        assert_ne!(picks[0].ip, picks[1].ip);
    }
}
