//! Multi-module integration tests exercised against the in-process
//! `network-local` backend: no mocks of `Module` or the coordinator, just
//! real modules talking over the real (simulated) multicast transport.

#![cfg(feature = "network-local")]

use patch_fabric::socket_local::LocalInterface;
use patch_fabric::{
    AudioPacket, EventHandler, GlobalPatchState, InputJackHandle, Module, ModuleId, OutputJackHandle,
    ProcessBlock,
};
use rand::rngs::mock::StepRng;

struct NullHandler;

impl<const I: usize, const O: usize> EventHandler<I, O> for NullHandler {}

/// Emits a caller-controlled sample on channel 0 of its single output block,
/// every tick, once it has been handed its jack handle.
struct SourceHandler {
    handle: Option<OutputJackHandle>,
    value: i16,
}

impl SourceHandler {
    fn new() -> Self {
        SourceHandler { handle: None, value: 0 }
    }

    fn set_handle(&mut self, handle: OutputJackHandle) {
        self.handle = Some(handle);
    }

    fn set_value(&mut self, value: i16) {
        self.value = value;
    }
}

impl EventHandler<0, 1> for SourceHandler {
    fn process(&mut self, block: &mut ProcessBlock<0, 1>) {
        if let Some(handle) = self.handle {
            let mut packet = AudioPacket::default();
            packet.data[0].data[0] = self.value;
            block.set_output(handle, packet);
        }
    }
}

/// Records channel 0 of frame 0 of every input block it is handed, once it
/// has been handed its jack handle.
struct RecorderHandler {
    handle: Option<InputJackHandle>,
    observed: Vec<i16>,
}

impl RecorderHandler {
    fn new() -> Self {
        RecorderHandler {
            handle: None,
            observed: Vec::new(),
        }
    }

    fn set_handle(&mut self, handle: InputJackHandle) {
        self.handle = Some(handle);
    }
}

impl EventHandler<1, 0> for RecorderHandler {
    fn process(&mut self, block: &mut ProcessBlock<1, 0>) {
        if let Some(handle) = self.handle {
            let packet = block.get_input(handle);
            self.observed.push(packet.data[0].data[0]);
        }
    }
}

#[test]
fn lone_module_becomes_leader_and_reports_idle() {
    let iface: LocalInterface<0, 0> = LocalInterface::new(10);
    let mut m: Module<_, _, NullHandler, 0, 0> =
        Module::new(iface, StepRng::new(2, 1), ModuleId::from("solo"), 0, NullHandler, 0);

    for t in 1..=500 {
        m.poll(t).unwrap();
    }

    assert!(m.is_leader());
    assert_eq!(m.patch_state(), GlobalPatchState::Idle);
}

#[test]
fn three_nodes_converge_on_exactly_one_leader() {
    let net = 11u8;
    let mut a: Module<_, _, NullHandler, 0, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        0,
        NullHandler,
        0,
    );
    let mut b: Module<_, _, NullHandler, 0, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(5, 3),
        ModuleId::from("b"),
        0,
        NullHandler,
        0,
    );
    let mut c: Module<_, _, NullHandler, 0, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(9, 7),
        ModuleId::from("c"),
        0,
        NullHandler,
        0,
    );

    for t in 1..=2000 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }

    // Only `is_leader` is observable from outside the coordinator (Follower
    // vs. Candidate isn't exposed), so this checks "exactly one aggregator",
    // the part of the invariant that actually drives patch-state behavior.
    let leaders = [a.is_leader(), b.is_leader(), c.is_leader()]
        .iter()
        .filter(|&&x| x)
        .count();
    assert_eq!(leaders, 1);
}

#[test]
fn simple_patch_connects_matching_jacks() {
    let net = 12u8;
    let mut a: Module<_, _, NullHandler, 0, 1> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        120,
        NullHandler,
        0,
    );
    let mut b: Module<_, _, NullHandler, 1, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(7, 5),
        ModuleId::from("b"),
        40,
        NullHandler,
        0,
    );

    let o1 = a.add_output_jack("o1").unwrap();
    let i1 = b.add_input_jack("i1").unwrap();

    for t in 1..=500 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }

    a.set_output_patch_enabled(o1, true).unwrap();
    b.set_input_patch_enabled(i1, true).unwrap();
    for t in 501..=700 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }

    assert!(b.is_input_patched(i1));
    assert_eq!(b.input_hue(i1), 120);

    a.set_output_patch_enabled(o1, false).unwrap();
    b.set_input_patch_enabled(i1, false).unwrap();
    for t in 701..=750 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }

    // Releasing the patch-enable buttons doesn't tear down the connection
    // itself, only the "held" signal that drove the toggle.
    assert!(a.is_output_patched(o1));
    assert!(b.is_input_patched(i1));
}

#[test]
fn repatching_an_input_drops_the_stale_source() {
    let net = 13u8;
    let mut a: Module<_, _, NullHandler, 0, 1> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        120,
        NullHandler,
        0,
    );
    let mut b: Module<_, _, NullHandler, 1, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(7, 5),
        ModuleId::from("b"),
        40,
        NullHandler,
        0,
    );
    let mut c: Module<_, _, NullHandler, 0, 1> = Module::new(
        LocalInterface::new(net),
        StepRng::new(13, 11),
        ModuleId::from("c"),
        200,
        NullHandler,
        0,
    );

    let o1 = a.add_output_jack("o1").unwrap();
    let i1 = b.add_input_jack("i1").unwrap();
    let o2 = c.add_output_jack("o2").unwrap();

    for t in 1..=500 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }

    // First patch B's input to A's output.
    a.set_output_patch_enabled(o1, true).unwrap();
    b.set_input_patch_enabled(i1, true).unwrap();
    for t in 501..=700 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }
    a.set_output_patch_enabled(o1, false).unwrap();
    b.set_input_patch_enabled(i1, false).unwrap();
    for t in 701..=750 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }

    assert!(b.is_input_patched(i1));
    assert_eq!(b.input_hue(i1), 120);
    assert!(a.is_output_patched(o1));

    // Now re-patch the same input to C's output instead.
    b.set_input_patch_enabled(i1, true).unwrap();
    c.set_output_patch_enabled(o2, true).unwrap();
    for t in 751..=950 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }
    b.set_input_patch_enabled(i1, false).unwrap();
    c.set_output_patch_enabled(o2, false).unwrap();
    for t in 951..=1000 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
        c.poll(t).unwrap();
    }

    assert_eq!(b.input_hue(i1), 200);
    assert!(c.is_output_patched(o2));
    // A's old subscriber must have been dropped once B moved to C, not left
    // dangling on A's subscriber set forever.
    assert!(!a.is_output_patched(o1));
}

#[test]
fn a_block_round_trips_within_one_tick() {
    let net = 14u8;
    let mut a: Module<_, _, SourceHandler, 0, 1> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        120,
        SourceHandler::new(),
        0,
    );
    let mut b: Module<_, _, RecorderHandler, 1, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(7, 5),
        ModuleId::from("b"),
        40,
        RecorderHandler::new(),
        0,
    );

    let o1 = a.add_output_jack("o1").unwrap();
    let i1 = b.add_input_jack("i1").unwrap();
    a.event_handler_mut().set_handle(o1);
    b.event_handler_mut().set_handle(i1);

    for t in 1..=500 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }
    a.set_output_patch_enabled(o1, true).unwrap();
    b.set_input_patch_enabled(i1, true).unwrap();
    for t in 501..=700 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }
    a.set_output_patch_enabled(o1, false).unwrap();
    b.set_input_patch_enabled(i1, false).unwrap();
    assert!(b.is_input_patched(i1));

    a.event_handler_mut().set_value(42);
    let t = 701;
    a.poll(t).unwrap();
    b.poll(t).unwrap();

    assert_eq!(*b.event_handler().observed.last().unwrap(), 42);
}

#[test]
fn requesting_a_snapshot_collects_a_response_from_every_module() {
    let net = 16u8;
    let mut a: Module<_, _, NullHandler, 0, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        0,
        NullHandler,
        0,
    );
    let mut b: Module<_, _, NullHandler, 0, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(7, 5),
        ModuleId::from("b"),
        0,
        NullHandler,
        0,
    );

    for t in 1..=10 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }

    a.request_snapshot().unwrap();
    for t in 11..=20 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }

    let mut uuids: Vec<&str> = a.captured_snapshots().iter().map(|r| r.uuid.as_str()).collect();
    uuids.sort_unstable();
    assert_eq!(uuids, vec!["a", "b"]);

    // A second capture replaces rather than accumulates.
    a.request_snapshot().unwrap();
    for t in 21..=30 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }
    assert_eq!(a.captured_snapshots().len(), 2);
}

#[test]
fn packet_loss_is_masked_by_holding_the_last_block() {
    let net = 15u8;
    let mut a: Module<_, _, SourceHandler, 0, 1> = Module::new(
        LocalInterface::new(net),
        StepRng::new(2, 1),
        ModuleId::from("a"),
        120,
        SourceHandler::new(),
        0,
    );
    let mut b: Module<_, _, RecorderHandler, 1, 0> = Module::new(
        LocalInterface::new(net),
        StepRng::new(7, 5),
        ModuleId::from("b"),
        40,
        RecorderHandler::new(),
        0,
    );

    let o1 = a.add_output_jack("o1").unwrap();
    let i1 = b.add_input_jack("i1").unwrap();
    a.event_handler_mut().set_handle(o1);
    b.event_handler_mut().set_handle(i1);

    for t in 1..=500 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }
    a.set_output_patch_enabled(o1, true).unwrap();
    b.set_input_patch_enabled(i1, true).unwrap();
    for t in 501..=700 {
        a.poll(t).unwrap();
        b.poll(t).unwrap();
    }
    a.set_output_patch_enabled(o1, false).unwrap();
    b.set_input_patch_enabled(i1, false).unwrap();
    assert!(b.is_input_patched(i1));

    // B is not polled again until the end: its jack channel holds at most
    // BUFFER_SIZE (8) blocks, so once A has sent 3 more than that, the
    // earliest overflow is silently dropped by the transport itself (see
    // `socket_local::publish`'s `TrySendError::Full` arm) — a real loss,
    // not a simulated one.
    let last = 700i64;
    for k in 1..=11i64 {
        a.event_handler_mut().set_value(k as i16);
        a.poll(last + k).unwrap();
    }

    // One call on B catches up all 11 elapsed ticks at once.
    b.poll(last + 11).unwrap();

    let observed = &b.event_handler().observed;
    assert_eq!(observed.len(), 11);
    assert_eq!(&observed[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(&observed[8..11], &[8, 8, 8]);
}
