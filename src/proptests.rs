use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::clock::{ManualClock, TickClock};
use crate::monitor::{MonitorConfig, RateMonitor};
use crate::packet::RawPacket;
use crate::tree::NODE_COST;

/// Addresses built from a handful of octet values so sequences collide,
/// share prefixes and revisit buckets that folds may have evicted.
#[derive(Debug, Clone, Copy)]
struct Addr([u8; 4]);

fn octet() -> prop::sample::Select<u8> {
    prop::sample::select(vec![0u8, 1, 2, 10, 255])
}

impl Arbitrary for Addr {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        prop::array::uniform4(octet()).prop_map(Addr).boxed()
    }
}

/// Annotation level within the tree depth.
#[derive(Debug, Clone, Copy)]
struct Level(u8);

impl Arbitrary for Level {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        (0u8..4).prop_map(Level).boxed()
    }
}

/// Memory ceilings worth exercising: unbounded, the minimum, and a little
/// above it (everything nonzero clamps to at least the minimum).
#[derive(Debug, Clone, Copy)]
struct MemmaxKib(usize);

impl Arbitrary for MemmaxKib {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: ()) -> Self::Strategy {
        prop::sample::select(vec![0usize, 1, 100, 150]).prop_map(MemmaxKib).boxed()
    }
}

#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Push { src: Addr, dst: Addr, reverse: bool },
    Pull { src: Addr, dst: Addr },
    Advance { ticks: u8 },
    SetMemmax { kib: MemmaxKib },
    AnnoLevel { addr: Addr, level: Level },
    Reset,
}

/// Executes actions through the public surface and audits the structural
/// invariants after every one of them.
struct Harness {
    monitor: RateMonitor<ManualClock>,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(100);
        let config = MonitorConfig {
            memmax_kib: 100,
            ..MonitorConfig::default()
        };
        let monitor = RateMonitor::with_clock(config, clock.clone()).unwrap();
        Self { monitor, clock }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Push { src, dst, reverse } => {
                let mut pkt = RawPacket::ipv4(src.0, dst.0, 60);
                self.monitor.push(usize::from(reverse), &mut pkt);
            }
            Action::Pull { src, dst } => {
                let mut pkt = RawPacket::ipv4(src.0, dst.0, 60);
                self.monitor.pull(0, &mut pkt);
            }
            Action::Advance { ticks } => {
                self.clock.advance(u64::from(ticks));
            }
            Action::SetMemmax { kib } => {
                self.monitor.set_memmax_kib(kib.0);
            }
            Action::AnnoLevel { addr, level } => {
                let until = self.clock.now() + 3 * self.clock.freq();
                self.monitor
                    .set_anno_level(addr.0.into(), level.0, until);
            }
            Action::Reset => {
                self.monitor.reset();
                assert_eq!(self.monitor.allocated_bytes(), NODE_COST);
            }
        }
        // Age list == reachable non-root nodes, exact byte ledger, depth
        // bound, parent/child symmetry, ceiling respected.
        self.monitor.assert_consistent();
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn invariants_hold_under_any_action_sequence(
        actions in prop::collection::vec(any::<Action>(), 1..48)
    ) {
        let mut harness = Harness::new();
        for action in actions {
            harness.execute(action);
        }
    }

    #[test]
    fn unbounded_monitor_never_breaks_structure(
        addrs in prop::collection::vec(any::<Addr>(), 1..64),
        gap in 0u64..300
    ) {
        let clock = ManualClock::new(100);
        let monitor =
            RateMonitor::with_clock(MonitorConfig::default(), clock.clone()).unwrap();
        for pair in addrs.chunks(2) {
            let dst = pair.get(1).copied().unwrap_or(pair[0]);
            let mut pkt = RawPacket::ipv4(pair[0].0, dst.0, 60);
            monitor.push(0, &mut pkt);
            clock.advance(gap);
        }
        monitor.assert_consistent();
        monitor.reset();
        prop_assert_eq!(monitor.allocated_bytes(), NODE_COST);
    }
}
