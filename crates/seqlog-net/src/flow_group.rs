//! Traffic Shaping
//!
//! Outgoing bytes are admitted by flow groups, one per location scope.
//! A flow group keeps a token bucket per priority; a message drains its
//! serialized cost from the bucket of its priority, and when the bucket
//! is dry the message (or a caller-supplied bandwidth callback) is
//! parked on a deferred queue until replenishment.
//!
//! Replenishment is driven by the worker's shaping tick: elapsed time
//! converts to tokens per the configured policy, deferred envelopes are
//! released in priority order, and parked callbacks fire once their
//! priority has tokens again.

use std::collections::VecDeque;

use seqlog_core::{Address, LocationScope, Priority};

use crate::connection::Envelope;
use crate::settings::{BucketPolicy, ShapingConfig};

/// Byte-denominated token bucket.
#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    level: i64,
    policy: BucketPolicy,
}

impl TokenBucket {
    fn new(policy: BucketPolicy) -> Self {
        Self {
            // Start full so short-lived processes are not throttled on
            // their first burst.
            level: if policy.is_unlimited() {
                0
            } else {
                policy.burst_bytes
            },
            policy,
        }
    }

    fn can_drain(&self) -> bool {
        self.policy.is_unlimited() || self.level > 0
    }

    fn drain(&mut self, cost: usize) {
        if !self.policy.is_unlimited() {
            // May go negative; an oversized message borrows against
            // future replenishment rather than being undeliverable.
            self.level -= cost as i64;
        }
    }

    fn fill(&mut self, elapsed_micros: u64) {
        if self.policy.is_unlimited() {
            return;
        }
        let add = (self.policy.bytes_per_sec as i128 * elapsed_micros as i128 / 1_000_000) as i64;
        self.level = (self.level.saturating_add(add)).min(self.policy.burst_bytes);
    }
}

/// Envelope parked for bandwidth, remembering which connection it must
/// be released on.
pub struct DeferredEnvelope {
    pub addr: Address,
    pub envelope: Envelope,
}

/// Caller-supplied callback fired when bandwidth becomes available.
pub type BwCallback = Box<dyn FnOnce() + Send>;

/// Running totals published by each flow group.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowGroupStats {
    pub direct_dispatched: u64,
    pub deferred: u64,
    pub discarded: u64,
    pub cb_registered: u64,
}

pub struct FlowGroup {
    scope: LocationScope,
    buckets: [TokenBucket; Priority::COUNT],
    deferred: [VecDeque<DeferredEnvelope>; Priority::COUNT],
    bw_callbacks: [VecDeque<BwCallback>; Priority::COUNT],
    pub stats: FlowGroupStats,
}

impl FlowGroup {
    fn new(scope: LocationScope, policy: [BucketPolicy; Priority::COUNT]) -> Self {
        Self {
            scope,
            buckets: policy.map(TokenBucket::new),
            deferred: Default::default(),
            bw_callbacks: Default::default(),
            stats: FlowGroupStats::default(),
        }
    }

    pub fn scope(&self) -> LocationScope {
        self.scope
    }

    pub fn can_drain(&self, priority: Priority) -> bool {
        self.buckets[priority.index()].can_drain()
    }

    /// Admit `cost` bytes at `priority` if the bucket allows, deducting
    /// on success. Messages behind deferred traffic of the same
    /// priority must also wait, or they would overtake.
    pub fn try_drain(&mut self, cost: usize, priority: Priority) -> bool {
        if !self.deferred[priority.index()].is_empty() {
            return false;
        }
        let bucket = &mut self.buckets[priority.index()];
        if !bucket.can_drain() {
            return false;
        }
        bucket.drain(cost);
        self.stats.direct_dispatched += 1;
        true
    }

    /// Park an envelope until tokens are available.
    pub fn push_envelope(&mut self, deferred: DeferredEnvelope) {
        let priority = deferred.envelope.priority();
        self.stats.deferred += 1;
        self.deferred[priority.index()].push_back(deferred);
    }

    /// Park a bandwidth-available callback.
    pub fn push_callback(&mut self, cb: BwCallback, priority: Priority) {
        self.stats.cb_registered += 1;
        self.bw_callbacks[priority.index()].push_back(cb);
    }

    /// Add `elapsed` worth of tokens and hand back every envelope that
    /// can now drain, highest priority first. Parked callbacks fire for
    /// priorities that still have tokens after releases.
    pub fn replenish(&mut self, elapsed_micros: u64) -> Vec<DeferredEnvelope> {
        for bucket in &mut self.buckets {
            bucket.fill(elapsed_micros);
        }

        let mut released = Vec::new();
        for priority in Priority::all() {
            let idx = priority.index();
            while let Some(head) = self.deferred[idx].front() {
                let cost = head.envelope.cost();
                if !self.buckets[idx].can_drain() {
                    break;
                }
                self.buckets[idx].drain(cost);
                released.push(self.deferred[idx].pop_front().expect("front checked"));
            }
            while self.buckets[idx].can_drain() {
                match self.bw_callbacks[idx].pop_front() {
                    Some(cb) => cb(),
                    None => break,
                }
            }
        }
        released
    }

    /// Drop every deferred envelope bound for `addr`, returning them so
    /// the caller can flush completions with the close reason.
    pub fn drop_for(&mut self, addr: Address) -> Vec<Envelope> {
        let mut dropped = Vec::new();
        for queue in &mut self.deferred {
            let mut keep = VecDeque::with_capacity(queue.len());
            while let Some(deferred) = queue.pop_front() {
                if deferred.addr == addr {
                    dropped.push(deferred.envelope);
                } else {
                    keep.push_back(deferred);
                }
            }
            *queue = keep;
        }
        dropped
    }

    pub fn num_deferred(&self) -> usize {
        self.deferred.iter().map(VecDeque::len).sum()
    }
}

/// The per-worker set of flow groups, one per location scope.
pub struct ShapingContainer {
    groups: Vec<FlowGroup>,
}

impl ShapingContainer {
    pub fn new(config: &ShapingConfig) -> Self {
        let groups = LocationScope::all()
            .into_iter()
            .map(|scope| FlowGroup::new(scope, config.policy(scope)))
            .collect();
        Self { groups }
    }

    pub fn group(&self, scope: LocationScope) -> &FlowGroup {
        &self.groups[scope.index()]
    }

    pub fn group_mut(&mut self, scope: LocationScope) -> &mut FlowGroup {
        &mut self.groups[scope.index()]
    }

    /// Replenish every group; returns all released envelopes.
    pub fn replenish_all(&mut self, elapsed_micros: u64) -> Vec<DeferredEnvelope> {
        let mut released = Vec::new();
        for group in &mut self.groups {
            released.append(&mut group.replenish(elapsed_micros));
        }
        released
    }

    /// Drop deferred envelopes for `addr` across all groups.
    pub fn drop_for(&mut self, addr: Address) -> Vec<Envelope> {
        let mut dropped = Vec::new();
        for group in &mut self.groups {
            dropped.append(&mut group.drop_for(addr));
        }
        dropped
    }
}
