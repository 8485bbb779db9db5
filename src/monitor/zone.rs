//! Per-zone node state machine (spec §3 "Zone", §4.5).
//!
//! Grounded on `original_source/src/frontend/zone.hh` (`ZoneState`,
//! `NodeState`): a zone owns a fixed set of nodes, partitioned along two
//! independent axes — availability (`available` / `unavailable`, FIFO
//! deques) and vulnerability (`vulnerable` / `invulnerable` flag sets). A
//! node's flag only changes via explicit promotion (invulnerable→
//! vulnerable) or automatic recovery after `recovery_time` ticks
//! (vulnerable→invulnerable); its availability only changes via the
//! trace-driven `advance` step.

use std::collections::VecDeque;

use fnv::FnvHashSet;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Invulnerable,
    Vulnerable,
}

#[derive(Debug, Clone)]
struct NodeState {
    id: u32,
    flag: NodeFlag,
    ticks_since_vulnerable: u32,
}

/// A single failure zone: a fixed roster of nodes drawn from one trace,
/// plus the region it belongs to for the dispatcher's diversity check.
pub struct Zone {
    pub region_id: u32,
    ips: Vec<String>,
    nodes: Vec<NodeState>,
    available: VecDeque<u32>,
    unavailable: VecDeque<u32>,
    vulnerable: FnvHashSet<u32>,
    invulnerable: FnvHashSet<u32>,
    new_unavailable: FnvHashSet<u32>,
    recovery_time: u32,
    to_vul_num: u32,
}

impl Zone {
    pub fn new(ips: Vec<String>, region_id: u32, recovery_time: u32, to_vul_num: u32) -> Self {
        let total = ips.len() as u32;
        let mut nodes = Vec::with_capacity(ips.len());
        let mut available = VecDeque::with_capacity(ips.len());
        let mut invulnerable = FnvHashSet::default();
        for id in 0..total {
            nodes.push(NodeState {
                id,
                flag: NodeFlag::Invulnerable,
                ticks_since_vulnerable: 0,
            });
            available.push_back(id);
            invulnerable.insert(id);
        }

        let mut zone = Zone {
            region_id,
            ips,
            nodes,
            available,
            unavailable: VecDeque::new(),
            vulnerable: FnvHashSet::default(),
            invulnerable,
            new_unavailable: FnvHashSet::default(),
            recovery_time,
            to_vul_num,
        };
        zone.flag_initialization();
        zone
    }

    /// Seeds the head of `available` as vulnerable so the first tick has a
    /// testable invulnerable/vulnerable contrast (spec §4.5
    /// "Initialization").
    fn flag_initialization(&mut self) {
        if let Some(&start) = self.available.front() {
            self.promote_to_vulnerable(start);
        }
    }

    fn promote_to_vulnerable(&mut self, id: u32) {
        if self.invulnerable.remove(&id) {
            self.vulnerable.insert(id);
            self.nodes[id as usize].flag = NodeFlag::Vulnerable;
            self.nodes[id as usize].ticks_since_vulnerable = 0;
        }
    }

    /// Advances recovery timers: every vulnerable node's tick counter
    /// increments; at exactly `recovery_time` it flips back to
    /// invulnerable (spec §4.5 step 1, the "Vulnerability recovery"
    /// invariant).
    fn update_node_time(&mut self) {
        let recovered: Vec<u32> = self
            .vulnerable
            .iter()
            .copied()
            .filter(|&id| {
                let node = &self.nodes[id as usize];
                node.ticks_since_vulnerable + 1 >= self.recovery_time
            })
            .collect();

        for id in &self.vulnerable.iter().copied().collect::<Vec<_>>() {
            if !recovered.contains(id) {
                self.nodes[*id as usize].ticks_since_vulnerable += 1;
            }
        }

        for id in recovered {
            self.vulnerable.remove(&id);
            self.invulnerable.insert(id);
            self.nodes[id as usize].flag = NodeFlag::Invulnerable;
            self.nodes[id as usize].ticks_since_vulnerable = 0;
        }
    }

    /// Moves node ids between `available`/`unavailable` FIFO-style so that
    /// `available.len() == current_available`, recording exactly the
    /// moved-out ids in `new_unavailable` (spec §4.5 step 2).
    fn update_availability(&mut self, current_available: u32) {
        self.new_unavailable.clear();
        let current_available = current_available as usize;

        if current_available >= self.available.len() {
            let to_move = current_available - self.available.len();
            for _ in 0..to_move {
                if let Some(id) = self.unavailable.pop_front() {
                    self.available.push_back(id);
                }
            }
        } else {
            let to_move = self.available.len() - current_available;
            for _ in 0..to_move {
                if let Some(id) = self.available.pop_front() {
                    self.unavailable.push_back(id);
                    self.new_unavailable.insert(id);
                }
            }
        }

        debug_assert_eq!(self.available.len() + self.unavailable.len(), self.nodes.len());
    }

    /// `passive` flagging (spec §4.5): on any newly-unavailable invulnerable
    /// node, promote up to `to_vul_num` available invulnerable nodes.
    fn flag_passive(&mut self) {
        let mut needs_flag = false;
        for &id in &self.new_unavailable.clone() {
            needs_flag = true;
            if self.invulnerable.remove(&id) {
                self.vulnerable.insert(id);
                self.nodes[id as usize].flag = NodeFlag::Vulnerable;
                self.nodes[id as usize].ticks_since_vulnerable = 0;
            }
        }
        if !needs_flag {
            return;
        }
        self.promote_up_to(self.to_vul_num);
    }

    fn promote_up_to(&mut self, count: u32) {
        let mut promoted = 0;
        let candidates: Vec<u32> = self.available.iter().copied().collect();
        for id in candidates {
            if promoted == count {
                break;
            }
            if self.invulnerable.contains(&id) {
                self.promote_to_vulnerable(id);
                promoted += 1;
            }
        }
    }

    /// Promotes up to `count` available invulnerable nodes (`fgd`/`arima`
    /// cross-zone proactive flagging).
    pub fn promote_up_to_public(&mut self, count: u32) {
        self.promote_up_to(count);
    }

    /// Promotes every node in this zone to vulnerable (`ldd`/`fgd` modes).
    pub fn promote_all(&mut self) {
        let ids: Vec<u32> = (0..self.nodes.len() as u32).collect();
        for id in ids {
            self.promote_to_vulnerable(id);
        }
    }

    /// Resets every node in the zone to invulnerable (used by the `cee`
    /// volatile-set eviction path).
    pub fn demote_all(&mut self) {
        let ids: Vec<u32> = self.vulnerable.iter().copied().collect();
        for id in ids {
            self.vulnerable.remove(&id);
            self.invulnerable.insert(id);
            self.nodes[id as usize].flag = NodeFlag::Invulnerable;
            self.nodes[id as usize].ticks_since_vulnerable = 0;
        }
    }

    /// Runs one tick: recovery timers, availability update, `passive`
    /// flagging. `ldd`/`fgd`/`cee` are orchestrated a level up in
    /// `Monitor::tick`, since they reach across zones.
    pub fn advance(&mut self, current_available: u32, passive_flagging: bool) -> bool {
        self.update_node_time();
        self.update_availability(current_available);
        let had_preemption = !self.new_unavailable.is_empty();
        if passive_flagging {
            self.flag_passive();
        }
        had_preemption
    }

    pub fn new_unavailable_ips(&self) -> Vec<String> {
        self.new_unavailable.iter().map(|&id| self.ips[id as usize].clone()).collect()
    }

    pub fn available_ips(&self) -> Vec<String> {
        self.available.iter().map(|&id| self.ips[id as usize].clone()).collect()
    }

    pub fn available_invulnerable_ips(&self) -> Vec<String> {
        self.available
            .iter()
            .filter(|id| self.invulnerable.contains(id))
            .map(|&id| self.ips[id as usize].clone())
            .collect()
    }

    pub fn available_vulnerable_ips(&self) -> Vec<String> {
        self.available
            .iter()
            .filter(|id| self.vulnerable.contains(id))
            .map(|&id| self.ips[id as usize].clone())
            .collect()
    }

    pub fn all_ips(&self) -> &[String] {
        &self.ips
    }

    pub fn preemption_magnitude(&self) -> u32 {
        self.new_unavailable.len() as u32
    }

    /// Invariant check used by tests/assertions: every node is exactly one
    /// of available/unavailable, and exactly one of vulnerable/
    /// invulnerable.
    pub fn check_invariants(&self) {
        assert_eq!(self.available.len() + self.unavailable.len(), self.nodes.len());
        assert_eq!(self.vulnerable.len() + self.invulnerable.len(), self.nodes.len());
    }

    /// Weighted draw biasing toward the tail of `available` (spec_full
    /// §C.2, `get_ava_node_id_decrease`): used to steer parity/vulnerable
    /// leaning picks.
    pub fn weighted_decrease(&self, alpha: f64) -> Option<String> {
        let n = self.available.len();
        if n == 0 {
            return None;
        }
        if n == 1 {
            return Some(self.ips[self.available[0] as usize].clone());
        }
        let weights: Vec<f64> = (0..n - 1).map(|i| (-alpha * i as f64).exp()).collect();
        let sum: f64 = weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..1.0) * sum;
        for (i, w) in weights.iter().enumerate() {
            roll -= w;
            if roll <= 0.0 {
                return Some(self.ips[self.available[i] as usize].clone());
            }
        }
        Some(self.ips[*self.available.back().unwrap() as usize].clone())
    }

    /// Weighted draw biasing toward the head of `available` (spec_full
    /// §C.2, `get_ava_node_id_increase`).
    pub fn weighted_increase(&self, alpha: f64) -> Option<String> {
        let n = self.available.len();
        if n == 0 {
            return None;
        }
        let weights: Vec<f64> = (1..n).map(|i| (i as f64).powf(alpha)).collect();
        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Some(self.ips[self.available[0] as usize].clone());
        }
        let mut roll = rand::thread_rng().gen_range(0.0..1.0) * sum;
        for (offset, w) in weights.iter().enumerate() {
            roll -= w;
            if roll <= 0.0 {
                return Some(self.ips[self.available[offset + 1] as usize].clone());
            }
        }
        Some(self.ips[*self.available.back().unwrap() as usize].clone())
    }
}
