//! Per-module jack bookkeeping: names, ids, patch-enabled/patch-member
//! flags, and the data-plane state ([`InputReceiver`]/[`OutputTransmitter`])
//! backing each jack.

use crate::directive::{GlobalPatchState, HeldInputJack, HeldOutputJack, LocalState, PatchConnection};
use crate::network::Network;
use crate::receiver::InputReceiver;
use crate::transmitter::OutputTransmitter;
use crate::{AudioPacket, Error, JackId, ModuleId, NEUTRAL_HUE};
use heapless::{FnvIndexSet, String, Vec};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InputJackHandle(usize);

impl InputJackHandle {
    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OutputJackHandle(usize);

impl OutputJackHandle {
    pub(crate) fn index(&self) -> usize {
        self.0
    }
}

pub(crate) struct InputJack {
    name: String<32>,
    id: JackId,
    patch_enabled: bool,
    pub(crate) patch_member: bool,
    source: Option<HeldOutputJack>,
    hue: u16,
}

impl InputJack {
    fn empty() -> Self {
        InputJack {
            name: String::new(),
            id: 0,
            patch_enabled: false,
            patch_member: false,
            source: None,
            hue: NEUTRAL_HUE,
        }
    }
}

pub(crate) struct OutputJack {
    name: String<32>,
    id: JackId,
    hue: u16,
    patch_enabled: bool,
    pub(crate) patch_member: bool,
    subscribers: FnvIndexSet<(ModuleId, JackId), { crate::MAX_SUBSCRIBERS }>,
}

impl OutputJack {
    fn empty() -> Self {
        OutputJack {
            name: String::new(),
            id: 0,
            hue: 0,
            patch_enabled: false,
            patch_member: false,
            subscribers: FnvIndexSet::new(),
        }
    }
}

pub struct JackRegistry<const I: usize, const O: usize> {
    next_jack_id: JackId,
    next_input_slot: usize,
    next_output_slot: usize,
    inputs: [InputJack; I],
    outputs: [OutputJack; O],
    receivers: [InputReceiver; I],
    transmitters: [OutputTransmitter; O],
}

impl<const I: usize, const O: usize> JackRegistry<I, O> {
    pub(crate) fn new() -> Self {
        JackRegistry {
            next_jack_id: 0,
            next_input_slot: 0,
            next_output_slot: 0,
            inputs: [(); I].map(|_| InputJack::empty()),
            outputs: [(); O].map(|_| OutputJack::empty()),
            receivers: [(); I].map(|_| InputReceiver::new()),
            transmitters: [(); O].map(|_| OutputTransmitter::new()),
        }
    }

    pub fn add_input(&mut self, name: &str) -> Result<InputJackHandle, Error> {
        if self.next_input_slot >= I {
            return Err(Error::StorageFull);
        }
        let slot = self.next_input_slot;
        self.next_input_slot += 1;
        let id = self.next_jack_id;
        self.next_jack_id += 1;
        self.inputs[slot] = InputJack {
            name: String::from(name),
            id,
            patch_enabled: false,
            patch_member: false,
            source: None,
            hue: NEUTRAL_HUE,
        };
        Ok(InputJackHandle(slot))
    }

    pub fn add_output(&mut self, name: &str, hue: u16) -> Result<OutputJackHandle, Error> {
        if self.next_output_slot >= O {
            return Err(Error::StorageFull);
        }
        let slot = self.next_output_slot;
        self.next_output_slot += 1;
        let id = self.next_jack_id;
        self.next_jack_id += 1;
        self.outputs[slot] = OutputJack {
            name: String::from(name),
            id,
            hue,
            patch_enabled: false,
            patch_member: false,
            subscribers: FnvIndexSet::new(),
        };
        Ok(OutputJackHandle(slot))
    }

    pub(crate) fn input(&self, h: InputJackHandle) -> &InputJack {
        &self.inputs[h.0]
    }

    pub(crate) fn output(&self, h: OutputJackHandle) -> &OutputJack {
        &self.outputs[h.0]
    }

    pub(crate) fn transmitter(&self, h: OutputJackHandle) -> &OutputTransmitter {
        &self.transmitters[h.0]
    }

    pub fn set_input_patch_enabled(&mut self, h: InputJackHandle, status: bool) {
        self.inputs[h.0].patch_enabled = status;
    }

    pub fn set_output_patch_enabled(&mut self, h: OutputJackHandle, status: bool) {
        self.outputs[h.0].patch_enabled = status;
    }

    pub fn is_input_patched(&self, h: InputJackHandle) -> bool {
        self.inputs[h.0].source.is_some()
    }

    pub fn is_output_patched(&self, h: OutputJackHandle) -> bool {
        !self.outputs[h.0].subscribers.is_empty()
    }

    /// The directive-ready view of which of this module's jacks are
    /// currently held (front-panel patch button active), for the
    /// coordinator to advertise and match against peers.
    pub(crate) fn local_state<T: Network<I, O>>(
        &self,
        interface: &mut T,
        uuid: &ModuleId,
    ) -> LocalState {
        let mut held_inputs = Vec::new();
        for input in self.inputs.iter().filter(|j| j.patch_enabled) {
            let _ = held_inputs.push(HeldInputJack {
                uuid: uuid.clone(),
                id: input.id,
            });
        }

        let mut held_outputs = Vec::new();
        for (slot, output) in self.outputs.iter().enumerate() {
            if !output.patch_enabled {
                continue;
            }
            let (addr, port) = interface.jack_addr(slot).unwrap_or(([0, 0, 0, 0], 0));
            let _ = held_outputs.push(HeldOutputJack {
                uuid: uuid.clone(),
                id: output.id,
                color: output.hue,
                addr,
                port,
            });
        }

        LocalState {
            held_inputs,
            held_outputs,
        }
    }

    /// Every connection currently held by one of this module's input jacks,
    /// fully resolved, for preset capture. A connection is symmetric, so
    /// reporting it from the input side alone is enough to reconstruct the
    /// whole graph across all modules' snapshots.
    pub(crate) fn patch_connections(
        &self,
        uuid: &ModuleId,
    ) -> Vec<PatchConnection, { crate::directive::MAX_PATCHED }> {
        let mut out = Vec::new();
        for input in self.inputs.iter() {
            if let Some(source) = &input.source {
                let _ = out.push(PatchConnection {
                    input_uuid: uuid.clone(),
                    input_jack_id: input.id,
                    output_uuid: source.uuid.clone(),
                    output_jack_id: source.id,
                    output_addr: source.addr,
                    output_port: source.port,
                    output_color: source.color,
                });
            }
        }
        out
    }

    pub(crate) fn update_input<T: Network<I, O>>(&mut self, interface: &mut T, slot: usize) -> u32 {
        self.receivers[slot].update(interface, slot)
    }

    pub(crate) fn input_data(&mut self, slot: usize) -> AudioPacket {
        self.receivers[slot].get_data()
    }

    pub(crate) fn send_output<T: Network<I, O>>(
        &mut self,
        interface: &mut T,
        slot: usize,
        block: &AudioPacket,
    ) -> Result<(), Error> {
        self.transmitters[slot].send(interface, slot, block)
    }

    /// Unconditionally (re)connects `input_jack_id` to `source`, replacing
    /// any previous connection.
    pub(crate) fn connect_input<T: Network<I, O>>(
        &mut self,
        interface: &mut T,
        input_jack_id: JackId,
        source: HeldOutputJack,
        time: i64,
    ) -> Result<(), Error> {
        let slot = self.find_input_slot(input_jack_id)?;
        interface.jack_connect(slot, source.addr, time)?;
        self.inputs[slot].hue = source.color;
        self.inputs[slot].source = Some(source);
        self.receivers[slot].reset();
        Ok(())
    }

    /// Connects `input_jack_id` to `source` if not already connected to it,
    /// otherwise disconnects. Used for the interactive "press both ends"
    /// patch gesture, as opposed to an explicit preset directive.
    pub(crate) fn toggle_input<T: Network<I, O>>(
        &mut self,
        interface: &mut T,
        input_jack_id: JackId,
        source: HeldOutputJack,
        time: i64,
    ) -> Result<(), Error> {
        let slot = self.find_input_slot(input_jack_id)?;
        let already = self.inputs[slot]
            .source
            .as_ref()
            .map_or(false, |s| s.uuid == source.uuid && s.id == source.id);
        if already {
            interface.jack_disconnect(slot, time)?;
            self.inputs[slot].source = None;
            self.inputs[slot].hue = NEUTRAL_HUE;
            self.receivers[slot].reset();
        } else {
            self.connect_input(interface, input_jack_id, source, time)?;
        }
        Ok(())
    }

    pub(crate) fn subscribe_output(
        &mut self,
        output_jack_id: JackId,
        input: HeldInputJack,
    ) -> Result<(), Error> {
        let slot = self.find_output_slot(output_jack_id)?;
        self.outputs[slot]
            .subscribers
            .insert((input.uuid, input.id))
            .map_err(|_| Error::StorageFull)?;
        Ok(())
    }

    pub(crate) fn toggle_output_subscriber(&mut self, output_jack_id: JackId, input: HeldInputJack) {
        let slot = match self.find_output_slot(output_jack_id) {
            Ok(s) => s,
            Err(_) => return,
        };
        let key = (input.uuid, input.id);
        if self.outputs[slot].subscribers.contains(&key) {
            self.outputs[slot].subscribers.remove(&key);
        } else {
            let _ = self.outputs[slot].subscribers.insert(key);
        }
    }

    /// §4.8 step 3's un-gated third bullet, run by *every* module against
    /// every `PATCH_TOGGLED` broadcast (not just the input/output owners):
    /// drop `input` from any of this module's own outputs' subscriber sets
    /// except the one now named as `input`'s new source. A module whose
    /// output was just replaced as `input`'s source derives that directly
    /// from the same broadcast everyone else already received, so no
    /// separate message back to the stale source is needed.
    pub(crate) fn disconnect_stale_subscribers(
        &mut self,
        uuid: &ModuleId,
        input: &HeldInputJack,
        new_output: &HeldOutputJack,
    ) {
        let key = (input.uuid.clone(), input.id);
        for output in self.outputs.iter_mut() {
            let is_new_source = *uuid == new_output.uuid && output.id == new_output.id;
            if !is_new_source {
                output.subscribers.remove(&key);
            }
        }
    }

    /// Drops every currently-connected input, leaving multicast groups and
    /// reverting hues to neutral. Used before replaying a preset, so a
    /// restore always starts from a clean slate.
    pub(crate) fn disconnect_all_inputs<T: Network<I, O>>(&mut self, interface: &mut T, time: i64) {
        for slot in 0..I {
            let _ = self.disconnect_input_slot(interface, slot, time);
        }
    }

    /// Unconditionally disconnects the input at `slot`, if connected. Unlike
    /// [`Self::toggle_input`] this never reconnects; used by preset restore
    /// to drop a connection the incoming snapshot no longer names.
    pub(crate) fn disconnect_input_slot<T: Network<I, O>>(
        &mut self,
        interface: &mut T,
        slot: usize,
        time: i64,
    ) -> Result<(), Error> {
        if self.inputs[slot].source.take().is_some() {
            interface.jack_disconnect(slot, time)?;
            self.inputs[slot].hue = NEUTRAL_HUE;
            self.receivers[slot].reset();
        }
        Ok(())
    }

    pub(crate) fn input_id(&self, slot: usize) -> JackId {
        self.inputs[slot].id
    }

    pub(crate) fn input_source(&self, slot: usize) -> Option<HeldOutputJack> {
        self.inputs[slot].source.clone()
    }

    pub(crate) fn output_id(&self, slot: usize) -> JackId {
        self.outputs[slot].id
    }

    pub(crate) fn output_color(&self, slot: usize) -> u16 {
        self.outputs[slot].hue
    }

    /// Drops every subscriber of the output at `slot`. Used by preset
    /// restore, which rebuilds each output's subscriber set from scratch.
    pub(crate) fn clear_output_subscribers(&mut self, slot: usize) {
        self.outputs[slot].subscribers.clear();
    }

    pub(crate) fn add_output_subscriber(
        &mut self,
        slot: usize,
        input: (ModuleId, JackId),
    ) -> Result<(), Error> {
        self.outputs[slot]
            .subscribers
            .insert(input)
            .map_err(|_| Error::StorageFull)?;
        Ok(())
    }

    /// §4.8 step 1+2: every jack's `patch_member` is reset to `false` on
    /// every transition, then — only while `PATCH_ENABLED` — the held jack
    /// (if owned by self) and its already-connected partner jacks on self
    /// are marked. `PATCH_TOGGLED`/`BLOCKED` leave every jack unmarked,
    /// matching `is_patch_member`'s doc contract ("meaningful only during
    /// PATCH_ENABLED").
    pub(crate) fn recompute_patch_members(
        &mut self,
        state: GlobalPatchState,
        input: Option<&HeldInputJack>,
        output: Option<&HeldOutputJack>,
        uuid: &ModuleId,
    ) {
        for jack in self.inputs.iter_mut() {
            jack.patch_member = false;
        }
        for jack in self.outputs.iter_mut() {
            jack.patch_member = false;
        }

        if state != GlobalPatchState::PatchEnabled {
            return;
        }

        if let Some(input) = input {
            if input.uuid == *uuid {
                if let Ok(slot) = self.find_input_slot(input.id) {
                    self.inputs[slot].patch_member = true;
                }
            }
            let key = (input.uuid.clone(), input.id);
            for output_jack in self.outputs.iter_mut() {
                if output_jack.subscribers.contains(&key) {
                    output_jack.patch_member = true;
                }
            }
        }
        if let Some(output) = output {
            if output.uuid == *uuid {
                if let Ok(slot) = self.find_output_slot(output.id) {
                    self.outputs[slot].patch_member = true;
                }
            }
            for input_jack in self.inputs.iter_mut() {
                if let Some(source) = &input_jack.source {
                    if source.uuid == output.uuid && source.id == output.id {
                        input_jack.patch_member = true;
                    }
                }
            }
        }
    }

    fn find_input_slot(&self, id: JackId) -> Result<usize, Error> {
        self.inputs
            .iter()
            .position(|j| j.id == id)
            .ok_or(Error::InvalidJackId)
    }

    fn find_output_slot(&self, id: JackId) -> Result<usize, Error> {
        self.outputs
            .iter()
            .position(|j| j.id == id)
            .ok_or(Error::InvalidJackId)
    }
}
