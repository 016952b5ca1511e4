#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! A distributed fabric for a software-defined modular synthesizer: each
//! participating process instantiates one [`Module`], which owns a set of
//! typed input/output "jacks", a [`leader_election`] based patch-state
//! coordinator, and a fixed-cadence [`Module::poll`] tick loop that drives
//! both the control plane and the sample-accurate-to-the-packet data plane.
//!
//! Surrounding concerns — GUI widgets, MIDI parsing, DSP, audio device I/O,
//! preset UIs, discovery — are not part of this crate; they plug in through
//! [`EventHandler`].

#[cfg(not(any(
    feature = "network-smoltcp",
    feature = "network-native",
    feature = "network-local"
)))]
compile_error!("You must enable exactly one network feature");

#[cfg(all(
    feature = "network-smoltcp",
    feature = "network-native",
    feature = "network-local"
))]
compile_error!("You must enable exactly one network feature");

#[macro_use]
extern crate log;

#[cfg(feature = "network-local")]
#[macro_use]
extern crate lazy_static;

pub mod directive;
pub mod event_handler;
mod leader_election;
pub mod network;
pub mod preset;
pub mod registry;
mod receiver;
mod transmitter;

#[cfg(feature = "network-native")]
pub mod socket_native;

#[cfg(feature = "network-smoltcp")]
pub mod socket_smoltcp;

#[cfg(feature = "network-local")]
pub mod socket_local;

pub use directive::{
    Directive, GlobalPatchState, HeldInputJack, HeldOutputJack, LocalState, PatchConnection,
};
pub use event_handler::EventHandler;
pub use network::Network;
pub use registry::{InputJackHandle, JackRegistry, OutputJackHandle};

use heapless::String;
use leader_election::PatchCoordinator;
use rand_core::RngCore;
use zerocopy::{AsBytes, FromBytes};

/// Polyphony width carried by every jack.
pub const CHANNELS: usize = 8;
/// Samples per packet; one tick at [`PACKET_RATE`] moves exactly one block.
pub const BLOCK_SIZE: usize = 48;
pub type SampleType = i16;

/// Tick and packet cadence, in Hz. `SAMPLE_RATE` must be an integer multiple.
pub const PACKET_RATE: u32 = 1000;
pub const SAMPLE_RATE: f32 = 48000.0;

/// Maximum queued blocks per input before the oldest is dropped.
pub const BUFFER_SIZE: usize = 8;

/// Maximum number of modules the coordinator tracks at once.
pub const MAX_HOSTS: usize = 16;

/// Maximum held inputs/outputs a single module's [`LocalState`] can carry.
pub const MAX_LOCAL_HELD: usize = 8;

/// Maximum subscribers (downstream inputs) a single output jack can carry.
pub const MAX_SUBSCRIBERS: usize = 16;

/// Hue reported by an input jack that is not currently patched.
pub const NEUTRAL_HUE: u16 = 330;

#[cfg(feature = "network-native")]
pub(crate) const PREFERRED_SUBNET: &str = "10.0.0.0/8";

pub(crate) const PATCH_EP: &str = "239.0.0.0:19874";
pub(crate) const JACK_PORT: u16 = 19991;

const SW: usize = 64;
/// Globally unique, stable module identity; doubles as the Raft tiebreaker.
pub type ModuleId = String<SW>;
/// Identifier of a jack, unique within its owning module, never reused.
pub type JackId = u32;

#[derive(AsBytes, FromBytes, Copy, Clone, Default, Debug)]
#[repr(C)]
pub struct AudioFrame {
    pub data: [SampleType; CHANNELS],
}

#[derive(AsBytes, FromBytes, Copy, Clone, Debug)]
#[repr(C)]
pub struct AudioPacket {
    pub data: [AudioFrame; BLOCK_SIZE],
}

impl AudioPacket {
    /// Peak absolute magnitude across the block, normalized to `[0, 1]`.
    pub fn peak_normalized(&self) -> f32 {
        let peak = self
            .data
            .iter()
            .flat_map(|frame| frame.data.iter())
            .map(|s| (*s as i32).unsigned_abs())
            .max()
            .unwrap_or(0);
        peak as f32 / i16::MAX as f32
    }
}

impl Default for AudioPacket {
    fn default() -> Self {
        AudioPacket {
            data: [Default::default(); BLOCK_SIZE],
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum Error {
    General,
    Network,
    NoData,
    InvalidJackId,
    Parse,
    StorageFull,
}

/// One tick's worth of input/output blocks, handed to
/// [`EventHandler::process`]. Indices follow jack creation order.
pub struct ProcessBlock<const I: usize, const O: usize> {
    input: [AudioPacket; I],
    output: [AudioPacket; O],
}

impl<const I: usize, const O: usize> ProcessBlock<I, O> {
    pub fn get_input(&self, handle: InputJackHandle) -> &AudioPacket {
        &self.input[handle.index()]
    }

    pub fn set_output(&mut self, handle: OutputJackHandle, data: AudioPacket) {
        self.output[handle.index()] = data;
    }
}

impl<const I: usize, const O: usize> Default for ProcessBlock<I, O> {
    fn default() -> Self {
        Self {
            input: [Default::default(); I],
            output: [Default::default(); O],
        }
    }
}

/// A single module on the patch fabric: owns its jacks, its patch
/// coordinator, its network backend, and drives the tick loop.
///
/// `Module` is `no_std`, allocation-free: callers supply the current time
/// (milliseconds from an arbitrary start), a random source, and poll it at
/// regular intervals to perform network and jack I/O.
pub struct Module<T, R, H, const I: usize, const O: usize>
where
    T: Network<I, O>,
    R: RngCore,
    H: EventHandler<I, O>,
{
    uuid: ModuleId,
    color: u16,
    interface: T,
    coordinator: PatchCoordinator<R>,
    registry: JackRegistry<I, O>,
    event_handler: H,
    patch_state: GlobalPatchState,
    last_tick_time: Option<i64>,
    dropped_packets: u32,
    preset_capture: heapless::Vec<directive::DirectiveSnapshotResponse, { directive::MAX_PRESET_HOSTS }>,
}

impl<T, R, H, const I: usize, const O: usize> Module<T, R, H, I, O>
where
    T: Network<I, O>,
    R: RngCore,
    H: EventHandler<I, O>,
{
    pub fn new(interface: T, rand_source: R, id: ModuleId, color: u16, event_handler: H, time: i64) -> Self {
        Module {
            uuid: id.clone(),
            color,
            interface,
            coordinator: PatchCoordinator::new(id, time, rand_source),
            registry: JackRegistry::new(),
            event_handler,
            patch_state: GlobalPatchState::Idle,
            last_tick_time: None,
            dropped_packets: 0,
            preset_capture: heapless::Vec::new(),
        }
    }

    pub fn add_input_jack(&mut self, name: &str) -> Result<InputJackHandle, Error> {
        self.registry.add_input(name)
    }

    pub fn add_output_jack(&mut self, name: &str) -> Result<OutputJackHandle, Error> {
        self.registry.add_output(name, self.color)
    }

    pub fn set_input_patch_enabled(&mut self, handle: InputJackHandle, status: bool) -> Result<(), Error> {
        self.registry.set_input_patch_enabled(handle, status);
        self.broadcast_local_state()
    }

    pub fn set_output_patch_enabled(&mut self, handle: OutputJackHandle, status: bool) -> Result<(), Error> {
        self.registry.set_output_patch_enabled(handle, status);
        self.broadcast_local_state()
    }

    pub fn is_input_patched(&self, handle: InputJackHandle) -> bool {
        self.registry.is_input_patched(handle)
    }

    pub fn is_output_patched(&self, handle: OutputJackHandle) -> bool {
        self.registry.is_output_patched(handle)
    }

    pub fn is_input_patch_member(&self, handle: InputJackHandle) -> bool {
        self.registry.input(handle).patch_member
    }

    pub fn is_output_patch_member(&self, handle: OutputJackHandle) -> bool {
        self.registry.output(handle).patch_member
    }

    pub fn input_hue(&self, handle: InputJackHandle) -> u16 {
        self.registry.input(handle).hue
    }

    pub fn output_hue(&self, handle: OutputJackHandle) -> u16 {
        self.registry.output(handle).hue
    }

    pub fn get_output_level(&self, handle: OutputJackHandle) -> f32 {
        self.registry.transmitter(handle).get_level()
    }

    pub fn patch_state(&self) -> GlobalPatchState {
        self.patch_state
    }

    /// Whether this module currently holds the coordinator's `Leader` role,
    /// for monitoring and tests; never required for correct operation.
    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    /// Jacks only exist once `add_input_jack`/`add_output_jack` have run
    /// after construction, so an `EventHandler` that needs their handles
    /// (to call `ProcessBlock::get_input`/`set_output`) has to be handed
    /// them afterwards; this is the way back in to do that.
    pub fn event_handler_mut(&mut self) -> &mut H {
        &mut self.event_handler
    }

    pub fn event_handler(&self) -> &H {
        &self.event_handler
    }

    pub fn send_halt(&mut self) {
        let out = Directive::Halt(directive::DirectiveHalt {
            uuid: ModuleId::from("GLOBAL"),
        });
        if let Err(e) = self.send_directive(&out) {
            info!("Halt command failed {:?}", e);
        }
    }

    /// Begin a preset capture: clears any previously collected responses and
    /// broadcasts `SnapshotRequest`, which every module (including this one,
    /// via multicast loopback) answers with a `SnapshotResponse` that
    /// [`Self::poll`] accumulates into [`Self::captured_snapshots`].
    pub fn request_snapshot(&mut self) -> Result<(), Error> {
        self.preset_capture.clear();
        let out = Directive::SnapshotRequest(directive::DirectiveSnapshotRequest {
            uuid: self.uuid.clone(),
        });
        self.send_directive(&out)
    }

    /// Every `SnapshotResponse` collected since the last [`Self::request_snapshot`],
    /// one entry per module that has replied so far.
    pub fn captured_snapshots(&self) -> &[directive::DirectiveSnapshotResponse] {
        &self.preset_capture
    }

    /// Bundle the responses collected so far into a `SetPreset` ready to
    /// broadcast with [`Self::apply_preset`], or to serialize for later
    /// restore.
    pub fn save_preset(&self) -> directive::DirectiveSetPreset {
        directive::DirectiveSetPreset {
            uuid: self.uuid.clone(),
            data: self.preset_capture.clone(),
        }
    }

    /// Broadcast a previously captured (or externally constructed) preset.
    /// Every module, including this one via loopback, runs §4.7's
    /// `SetPreset` handler on receipt.
    pub fn apply_preset(&mut self, preset: directive::DirectiveSetPreset) -> Result<(), Error> {
        self.send_directive(&Directive::SetPreset(preset))
    }

    /// One pass through the tick loop. Drains all pending control-plane
    /// datagrams, then catches up on every tick elapsed since the last call,
    /// running jack I/O and the `process` callback once per tick.
    pub fn poll(&mut self, time: i64) -> Result<(), Error> {
        self.interface.poll(time)?;

        while let Some(directive) = self.recv_directive() {
            if let Err(e) = self.dispatch(directive, time) {
                info!("Failed to process directive: {:?}", e);
            }
        }

        let last = self.last_tick_time.unwrap_or(time.saturating_sub(1));
        let ticks = (time - last).max(0);
        self.last_tick_time = Some(time);

        for k in 1..=ticks {
            let tick_time = last + k;
            self.run_tick(tick_time)?;
        }

        self.interface.poll(time)?;

        if time % 10000 == 0 && self.dropped_packets != 0 {
            info!("{}: dropped packets: {:?}", self.uuid, self.dropped_packets);
            self.dropped_packets = 0;
        }

        Ok(())
    }

    fn run_tick(&mut self, tick_time: i64) -> Result<(), Error> {
        let mut block: ProcessBlock<I, O> = Default::default();

        for i in 0..I {
            self.dropped_packets += self.registry.update_input(&mut self.interface, i);
            block.input[i] = self.registry.input_data(i);
        }

        self.event_handler.process(&mut block);

        for i in 0..O {
            self.registry.send_output(&mut self.interface, i, &block.output[i])?;
        }

        if let Some(resp) = self.coordinator.poll(None, tick_time) {
            if let Err(e) = self.send_directive(&resp) {
                info!("Failed to send coordinator message: {:?}", e);
            }
            if let Directive::GlobalStateUpdate(gsu) = resp {
                self.apply_global_state_update(gsu, tick_time);
            }
        }

        Ok(())
    }

    /// Drains past any number of malformed/undecodable datagrams before
    /// giving up; only the absence of further data ends the drain, matching
    /// `receiver.rs::InputReceiver::update`'s loop-past-bad-packet behavior
    /// on the data plane.
    fn recv_directive(&mut self) -> Option<Directive> {
        let mut buf = [0u8; 2048];
        loop {
            match self.interface.recv_directive(&mut buf) {
                Ok(size) => match directive::decode(&buf[..size]) {
                    Ok(d) => return Some(d),
                    Err(e) => info!("Failed to decode directive: {:?}", e),
                },
                Err(_) => return None,
            }
        }
    }

    fn send_directive(&mut self, directive: &Directive) -> Result<(), Error> {
        let mut buf = [0u8; 2048];
        let encoded = directive::encode(directive, &mut buf)?;
        trace!("=> {:?}", directive);
        self.interface.send_directive(encoded)
    }

    fn broadcast_local_state(&mut self) -> Result<(), Error> {
        let local_state = self.registry.local_state(&mut self.interface, &self.uuid);
        self.coordinator.update_local_state(local_state.clone());
        let update = Directive::Update(directive::DirectiveUpdate {
            uuid: self.uuid.clone(),
            local_state,
        });
        self.send_directive(&update)
    }

    fn dispatch(&mut self, directive: Directive, time: i64) -> Result<(), Error> {
        trace!("<= {:?}", directive);
        match directive {
            Directive::GlobalStateUpdate(gsu) => {
                self.apply_global_state_update(gsu, time);
                Ok(())
            }
            Directive::Halt(h) => {
                if h.uuid == "GLOBAL" || h.uuid == self.uuid {
                    self.event_handler.halt();
                }
                Ok(())
            }
            Directive::SnapshotRequest(_) => {
                let data = self.event_handler.get_snapshot();
                let patched = self.registry.patch_connections(&self.uuid);
                let resp = Directive::SnapshotResponse(directive::DirectiveSnapshotResponse {
                    uuid: self.uuid.clone(),
                    data,
                    patched,
                });
                if let Err(e) = self.send_directive(&resp) {
                    info!("Failed to send snapshot response: {:?}", e);
                }
                Ok(())
            }
            Directive::SnapshotResponse(r) => {
                if r.uuid != self.uuid {
                    self.event_handler.received_snapshot(&r.uuid, &r.data);
                }
                preset::record_response(&mut self.preset_capture, r);
                Ok(())
            }
            Directive::SetPreset(preset) => self.apply_set_preset(preset, time),
            Directive::SetInputJack(m) => {
                if m.uuid == self.uuid {
                    self.registry.connect_input(
                        &mut self.interface,
                        m.connection.input_jack_id,
                        m.source,
                        time,
                    )?;
                }
                Ok(())
            }
            Directive::SetOutputJack(m) => {
                if m.uuid == self.uuid {
                    self.registry
                        .subscribe_output(m.connection.output_jack_id, m.source)?;
                }
                Ok(())
            }
            other => {
                if let Some(resp) = self.coordinator.poll(Some(other), time) {
                    if let Err(e) = self.send_directive(&resp) {
                        info!("Failed to send coordinator message: {:?}", e);
                    }
                    if let Directive::GlobalStateUpdate(gsu) = resp {
                        self.apply_global_state_update(gsu, time);
                    }
                }
                Ok(())
            }
        }
    }

    /// §4.7 `SetPreset` handler: if the bundle names this module, restore its
    /// opaque snapshot and reconcile jack topology against the connections
    /// the bundle records; otherwise clear every jack. See [`preset`].
    fn apply_set_preset(&mut self, preset: directive::DirectiveSetPreset, time: i64) -> Result<(), Error> {
        let uuid = self.uuid.clone();
        match preset::own_snapshot(&preset, &uuid) {
            Some(own) => {
                self.event_handler.set_snapshot(&own.data);

                for slot in 0..I {
                    let id = self.registry.input_id(slot);
                    let current = self.registry.input_source(slot);
                    let keep = current.as_ref().map_or(false, |src| {
                        preset::connections_into(&preset, &uuid).any(|c| {
                            c.input_jack_id == id && c.output_uuid == src.uuid && c.output_jack_id == src.id
                        })
                    });
                    if current.is_some() && !keep {
                        self.registry.disconnect_input_slot(&mut self.interface, slot, time)?;
                    }
                }

                for slot in 0..O {
                    self.registry.clear_output_subscribers(slot);
                    let out_id = self.registry.output_id(slot);
                    let color = self.registry.output_color(slot);
                    let (addr, port) = self.interface.jack_addr(slot)?;
                    for conn in preset::connections_out_of(&preset, &uuid).filter(|c| c.output_jack_id == out_id) {
                        let conn = conn.clone();
                        self.registry
                            .add_output_subscriber(slot, (conn.input_uuid.clone(), conn.input_jack_id))?;
                        let directive = Directive::SetInputJack(directive::DirectiveSetInputJack {
                            uuid: conn.input_uuid.clone(),
                            source: HeldOutputJack {
                                uuid: uuid.clone(),
                                id: out_id,
                                color,
                                addr,
                                port,
                            },
                            connection: conn,
                        });
                        self.send_directive(&directive)?;
                    }
                }
                Ok(())
            }
            None => {
                self.registry.disconnect_all_inputs(&mut self.interface, time);
                for slot in 0..O {
                    self.registry.clear_output_subscribers(slot);
                }
                Ok(())
            }
        }
    }

    fn apply_global_state_update(&mut self, gsu: directive::DirectiveGlobalStateUpdate, time: i64) {
        self.patch_state = gsu.patch_state;
        self.registry
            .recompute_patch_members(gsu.patch_state, gsu.input.as_ref(), gsu.output.as_ref(), &self.uuid);

        if gsu.patch_state == GlobalPatchState::PatchToggled {
            if let (Some(input), Some(output)) = (&gsu.input, &gsu.output) {
                if input.uuid == self.uuid {
                    if let Err(e) =
                        self.registry
                            .toggle_input(&mut self.interface, input.id, output.clone(), time)
                    {
                        info!("Jack connection error: {:?}", e);
                    }
                }
                if output.uuid == self.uuid {
                    self.registry.toggle_output_subscriber(output.id, input.clone());
                }
                // §4.8 step 3's third bullet carries no `if X == self` guard,
                // unlike the two above it: every module that sees this
                // broadcast — not just the input/output owners — drops
                // `input` from any of its own outputs that aren't the new
                // source, so a stale subscriber left behind by a re-patch
                // clears itself without a separate message back to it.
                self.registry.disconnect_stale_subscribers(&self.uuid, input, output);
            }
        }

        self.event_handler.patch(self.patch_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_packet_peak_normalized_is_zero_for_silence() {
        let pkt = AudioPacket::default();
        assert_eq!(pkt.peak_normalized(), 0.0);
    }

    #[test]
    fn audio_packet_peak_normalized_reports_loudest_sample() {
        let mut pkt = AudioPacket::default();
        pkt.data[3].data[2] = -16000;
        assert!((pkt.peak_normalized() - 16000.0 / i16::MAX as f32).abs() < 1e-6);
    }
}
