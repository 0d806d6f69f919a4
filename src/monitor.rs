//! Monitor core.
//!
//! Owns the prefix tree and its byte ledger behind one lock, ingests packets
//! on the push/pull paths, zooms buckets in when their rates cross the
//! threshold, folds cold subtrees back when memory runs out and renders the
//! operator-facing rate table.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;
use rand::Rng;

use crate::clock::{SystemClock, TickClock};
use crate::ewma::{RateEwma, SCALE};
use crate::packet::{parse_ipv4, Packet};
use crate::tree::{Counter, NodeRef, PrefixTree, COUNTER_COST, FAN_OUT, MAX_DEPTH, NODE_COST};

/// 16.16 fixed-point one; the sampling ratio never exceeds this.
pub const RATIO_ONE: u32 = 1 << 16;

/// Nonzero memory ceilings are clamped up to this many KiB.
pub const MEMMAX_MIN_KIB: usize = 100;

/// Divisor for the threshold escalation step used by forced folds.
const FOLD_INCREASE_FACTOR: u64 = 5;

/// What a packet contributes to the rates it traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Each packet counts 1.
    Packets,
    /// Each packet counts its IP total length in bytes.
    Bytes,
}

impl std::str::FromStr for CountMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_uppercase().as_str() {
            "PACKETS" => Ok(Self::Packets),
            "BYTES" => Ok(Self::Bytes),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Rejected monitor configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("monitor type should be \"PACKETS\" or \"BYTES\", got {0:?}")]
    UnknownMode(String),
    #[error("ratio must be between 0 and 1")]
    RatioOutOfRange,
    #[error("threshold must be positive")]
    ZeroThreshold,
}

/// Monitor configuration, fixed at construction. The memory ceiling and the
/// effective threshold can later move through the handler surface.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mode: CountMode,
    /// Byte offset of the IPv4 header within each packet.
    pub offset: usize,
    /// Push-path sampling ratio, 16.16 fixed point in (0, [`RATIO_ONE`]].
    pub ratio: u32,
    /// Zoom-in threshold in sample units per averaging interval.
    pub thresh: u64,
    /// Memory ceiling in KiB; 0 means unbounded.
    pub memmax_kib: usize,
    /// Stamp the packet annotation byte when an annotation rule fires.
    pub annotate: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: CountMode::Packets,
            offset: 0,
            ratio: RATIO_ONE,
            thresh: 1,
            memmax_kib: 0,
            annotate: true,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ratio == 0 || self.ratio > RATIO_ONE {
            return Err(ConfigError::RatioOutOfRange);
        }
        if self.thresh == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}

pub(crate) struct MonitorState {
    pub(crate) tree: PrefixTree,
    /// Effective threshold, pre-scaled by the sampling ratio so comparisons
    /// use raw EWMA averages.
    pub(crate) thresh: u64,
    /// Memory ceiling in bytes; 0 is unbounded.
    pub(crate) memmax: usize,
}

/// Per-packet IPv4 rate monitor.
///
/// Rates are bucketed by address prefix, one tree level per octet. A bucket
/// whose rate crosses the threshold grows a child level; cold subtrees are
/// folded back when the memory ceiling is hit. Packets enter through
/// [`push`](Self::push) or [`pull`](Self::pull) and leave unchanged except
/// for the user annotation byte.
pub struct RateMonitor<C: TickClock = SystemClock> {
    clock: C,
    mode: CountMode,
    offset: usize,
    ratio: u32,
    annotate: bool,
    /// Tick of the last reset; read without the lock by `look`.
    reset_tick: AtomicU64,
    state: Mutex<MonitorState>,
}

impl RateMonitor<SystemClock> {
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock::new())
    }
}

impl<C: TickClock> RateMonitor<C> {
    /// Build a monitor over the given tick source.
    pub fn with_clock(config: MonitorConfig, clock: C) -> Result<Self, ConfigError> {
        config.validate()?;
        let memmax = clamp_memmax(config.memmax_kib);
        let thresh = config.thresh.saturating_mul(config.ratio as u64) >> 16;
        Ok(Self {
            reset_tick: AtomicU64::new(clock.now()),
            clock,
            mode: config.mode,
            offset: config.offset,
            ratio: config.ratio,
            annotate: config.annotate,
            state: Mutex::new(MonitorState {
                tree: PrefixTree::new(),
                thresh,
                memmax,
            }),
        })
    }

    /// The monitor's tick source.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Process a packet arriving on `port` of the push path; the caller
    /// emits the packet on the matching output port afterwards. Port 0 is
    /// the forward direction, anything else reverse. One in `ratio` packets
    /// is sampled into the rates; the rest only traverse for annotation.
    pub fn push<P: Packet>(&self, port: usize, packet: &mut P) {
        // Draw outside the lock.
        let sampled = (rand::thread_rng().gen::<u16>() as u32) <= self.ratio;
        let mut state = self.state.lock();
        self.update_rates(&mut state, packet, port == 0, sampled);
    }

    /// Process a packet obtained from `port` of the pull path. Every pulled
    /// packet is a sample.
    pub fn pull<P: Packet>(&self, port: usize, packet: &mut P) {
        let mut state = self.state.lock();
        self.update_rates(&mut state, packet, port == 0, true);
    }

    /// Effective (ratio-scaled) zoom threshold.
    pub fn effective_thresh(&self) -> u64 {
        self.state.lock().thresh
    }

    /// Bytes currently charged for live nodes and counters.
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().tree.allocated()
    }

    /// Memory ceiling in bytes; 0 is unbounded.
    pub fn memmax_bytes(&self) -> usize {
        self.state.lock().memmax
    }

    /// Reconfigure the memory ceiling (KiB, 0 unbounded) and fold the tree
    /// down to it if it now overshoots.
    pub fn set_memmax_kib(&self, kib: usize) {
        let memmax = clamp_memmax(kib);
        let mut st = self.state.lock();
        st.memmax = memmax;
        if memmax > 0 && st.tree.allocated() > memmax {
            debug!(
                "memmax {} below {} live bytes, forcing folds",
                memmax,
                st.tree.allocated()
            );
            self.forced_fold(&mut st);
        }
    }

    /// Arm the annotation rule for `addr` at `level` (0-based octet index)
    /// until `until_tick`, creating the path as the memory ceiling permits.
    pub fn set_anno_level(&self, addr: Ipv4Addr, level: u8, until_tick: u64) {
        debug_assert!((level as usize) < MAX_DEPTH);
        let octets = addr.octets();
        let mut st = self.state.lock();
        let mut node = st.tree.root();
        for l in 0..level as usize {
            let byte = octets[l];
            if st.tree.counter(node, byte).is_none() && !self.make_counter(&mut st, node, byte, None)
            {
                return;
            }
            let mut child = st.tree.counter(node, byte).expect("just ensured").child;
            if child.is_null() {
                child = self.make_node(&mut st, node, byte);
            }
            if child.is_null() {
                return;
            }
            node = child;
        }
        let byte = octets[level as usize];
        if st.tree.counter(node, byte).is_none() && !self.make_counter(&mut st, node, byte, None) {
            return;
        }
        st.tree
            .counter_mut(node, byte)
            .expect("just ensured")
            .anno_until = until_tick;
    }

    /// Drop every bucket below the root and restart the reset clock.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.tree.clear_root_children();
        self.reset_tick.store(self.clock.now(), Ordering::Relaxed);
        debug!("reset: tree cleared");
    }

    /// Whole seconds elapsed since the last reset.
    pub fn seconds_since_reset(&self) -> u64 {
        let since = self
            .clock
            .now()
            .saturating_sub(self.reset_tick.load(Ordering::Relaxed));
        since / self.clock.freq()
    }

    /// Render the rate table: a seconds-since-reset line followed by one
    /// tab-indented line per bucket with a non-zero rate. The monitor lock
    /// is only attempted; a busy lock yields `unavailable` instead of
    /// stalling the packet path behind a full dump.
    pub fn look(&self) -> String {
        let mut out = format!("{}\n", self.seconds_since_reset());
        match self.state.try_lock() {
            Some(mut st) => {
                let now = self.clock.now();
                let root = st.tree.root();
                self.dump(&mut st.tree, root, "", now, &mut out);
            }
            None => out.push_str("unavailable\n"),
        }
        out
    }

    /// One descent per address: parse, pick the sample value, update source
    /// and destination paths with mirrored directions.
    fn update_rates<P: Packet>(
        &self,
        st: &mut MonitorState,
        packet: &mut P,
        forward: bool,
        do_ewma: bool,
    ) {
        let Some(fields) = parse_ipv4(packet.data(), self.offset) else {
            return;
        };
        let sample = match self.mode {
            CountMode::Packets => 1,
            CountMode::Bytes => u64::from(fields.total_len),
        };
        let now = self.clock.now();
        // Only the source walk carries the packet: annotation rules key on
        // the source prefix, the destination walk just mirrors the rates.
        self.update_address(st, fields.src, sample, now, forward, do_ewma, Some(packet));
        self.update_address::<P>(st, fields.dst, sample, now, !forward, do_ewma, None);
    }

    #[allow(clippy::too_many_arguments)]
    fn update_address<P: Packet>(
        &self,
        st: &mut MonitorState,
        addr: [u8; 4],
        sample: u64,
        now: u64,
        on_fwd: bool,
        do_ewma: bool,
        mut packet: Option<&mut P>,
    ) {
        let mut node = st.tree.root();
        let mut seed: Option<(RateEwma, RateEwma)> = None;
        for level in 0..MAX_DEPTH {
            let byte = addr[level];
            if st.tree.counter(node, byte).is_none()
                && (!do_ewma || !self.make_counter(st, node, byte, seed.as_ref()))
            {
                return;
            }
            let thresh = st.thresh;
            let (child, zoom, stamp) = {
                let counter = st.tree.counter_mut(node, byte).expect("just ensured");
                if do_ewma {
                    let rate = if on_fwd {
                        &mut counter.fwd_rate
                    } else {
                        &mut counter.rev_rate
                    };
                    rate.update(now, sample);
                }
                let stamp = self.annotate && packet.is_some() && counter.anno_until > now;
                let zoom = do_ewma
                    && counter.child.is_null()
                    && level + 1 < MAX_DEPTH
                    && (counter.fwd_rate.average() >= thresh
                        || counter.rev_rate.average() >= thresh);
                seed = Some((counter.fwd_rate.clone(), counter.rev_rate.clone()));
                (counter.child, zoom, stamp)
            };
            if stamp {
                if let Some(p) = packet.take() {
                    p.set_user_anno(level as u8 + 1);
                }
                return;
            }
            let child = if zoom {
                self.make_node(st, node, byte)
            } else {
                child
            };
            if child.is_null() {
                return;
            }
            node = child;
        }
    }

    /// Create the counter at (`node`, `byte`), seeded from the level-above
    /// rates when given. Fails when the memory ceiling would be broken.
    fn make_counter(
        &self,
        st: &mut MonitorState,
        node: NodeRef,
        byte: u8,
        seed: Option<&(RateEwma, RateEwma)>,
    ) -> bool {
        if st.memmax > 0 && st.tree.allocated() + COUNTER_COST > st.memmax {
            return false;
        }
        let mut counter = Counter::default();
        if let Some((fwd, rev)) = seed {
            counter.fwd_rate = fwd.clone();
            counter.rev_rate = rev.clone();
        }
        st.tree.insert_counter(node, byte, counter);
        true
    }

    /// Allocate the child node under (`parent`, `slot`), NULL when the
    /// memory ceiling would be broken.
    fn make_node(&self, st: &mut MonitorState, parent: NodeRef, slot: u8) -> NodeRef {
        if st.memmax > 0 && st.tree.allocated() + NODE_COST > st.memmax {
            return NodeRef::NULL;
        }
        st.tree.alloc_node(parent, slot)
    }

    /// Walk the age list evicting subtrees whose owning counter has both
    /// rates below `thresh`.
    ///
    /// The walk direction is drawn at random so repeated folds do not starve
    /// one end of the list. Coldness testing ages the owning counter's rates
    /// to the current tick, an observable side effect even when nothing is
    /// evicted. Stops once the ledger falls to the target: the ceiling when
    /// one is set, nine tenths of the current allocation otherwise.
    fn fold(&self, st: &mut MonitorState, thresh: u64) {
        let forward: bool = rand::thread_rng().gen();
        let now = self.clock.now();
        let target = if st.memmax > 0 {
            st.memmax
        } else {
            st.tree.allocated() * 9 / 10
        };
        let mut destroyed = 0usize;
        let mut cur = if forward {
            st.tree.first()
        } else {
            st.tree.last()
        };
        while !cur.is_null() {
            let (pnode, pbyte) = st.tree.node(cur).parent.expect("non-root on age list");
            let cold = {
                let owner = st
                    .tree
                    .counter_mut(pnode, pbyte)
                    .expect("owning counter of a live node");
                owner.fwd_rate.update(now, 0);
                owner.fwd_rate.average() < thresh && {
                    owner.rev_rate.update(now, 0);
                    owner.rev_rate.average() < thresh
                }
            };
            if cold {
                let (prev, next) = st.tree.destroy_subtree(cur);
                destroyed += 1;
                if st.tree.allocated() <= target {
                    break;
                }
                cur = if forward { next } else { prev };
            } else {
                cur = if forward {
                    st.tree.next_of(cur)
                } else {
                    st.tree.prev_of(cur)
                };
            }
        }
        debug!(
            "fold(thresh={thresh}) evicted {destroyed} subtrees, {} bytes live",
            st.tree.allocated()
        );
    }

    /// Fold with escalating thresholds until the ledger fits the ceiling.
    /// The step is at least 1 so the escalation terminates even for tiny
    /// thresholds; a large enough threshold condemns every non-root node.
    fn forced_fold(&self, st: &mut MonitorState) {
        let step = (st.thresh / FOLD_INCREASE_FACTOR).max(1);
        let mut thresh = st.thresh;
        while st.tree.allocated() > st.memmax {
            self.fold(st, thresh);
            thresh = thresh.saturating_add(step);
            if st.tree.first().is_null() {
                break;
            }
        }
    }

    /// Depth-first dump, ascending slot order, one extra leading tab per
    /// level. Buckets are selected on their pre-aging rates, then aged to
    /// `now` so the printed figures are current.
    fn dump(&self, tree: &mut PrefixTree, node: NodeRef, prefix: &str, now: u64, out: &mut String) {
        let freq = self.clock.freq();
        for byte in 0..FAN_OUT {
            let Some(counter) = tree.counter_mut(node, byte as u8) else {
                continue;
            };
            if counter.fwd_rate.average() == 0 && counter.rev_rate.average() == 0 {
                continue;
            }
            counter.fwd_rate.update(now, 0);
            counter.rev_rate.update(now, 0);
            let fwd = counter.fwd_rate.average() * freq;
            let rev = counter.rev_rate.average() * freq;
            let child = counter.child;

            let this_ip = if prefix.is_empty() {
                byte.to_string()
            } else {
                format!("{prefix}.{byte}")
            };
            out.push_str(&this_ip);
            out.push('\t');
            out.push_str(&unparse_scaled(fwd, SCALE));
            out.push('\t');
            out.push_str(&unparse_scaled(rev, SCALE));
            out.push('\n');

            if !child.is_null() {
                self.dump(tree, child, &format!("\t{this_ip}"), now, out);
            }
        }
    }
}

fn clamp_memmax(kib: usize) -> usize {
    if kib == 0 {
        0
    } else {
        kib.max(MEMMAX_MIN_KIB) * 1024
    }
}

/// Exact decimal rendering of a fixed-point value with `scale` fraction
/// bits. The denominator is a power of two, so the digit loop terminates.
fn unparse_scaled(value: u64, scale: u32) -> String {
    let mask = (1u64 << scale) - 1;
    let mut out = (value >> scale).to_string();
    let mut frac = value & mask;
    if frac == 0 {
        return out;
    }
    out.push('.');
    while frac != 0 {
        frac *= 10;
        out.push(char::from(b'0' + (frac >> scale) as u8));
        frac &= mask;
    }
    out
}

#[cfg(test)]
impl<C: TickClock> RateMonitor<C> {
    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, MonitorState> {
        self.state.lock()
    }

    /// Structural audit plus the ceiling bound, for tests.
    pub(crate) fn assert_consistent(&self) {
        let st = self.state.lock();
        st.tree.assert_consistent();
        if st.memmax > 0 {
            assert!(
                st.tree.allocated() <= st.memmax,
                "{} bytes live over a {} byte ceiling",
                st.tree.allocated(),
                st.memmax
            );
        }
    }
}
