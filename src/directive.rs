//! Wire format for the control plane: a tagged union of directives,
//! postcard-encoded, carried as bare UDP multicast payloads (no additional
//! framing byte — postcard's enum discriminant already disambiguates).

use crate::{Error, JackId, ModuleId, MAX_HOSTS, MAX_LOCAL_HELD};
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_PATCHED: usize = 8;
pub const SNAPSHOT_CAP: usize = 256;
pub const MAX_PRESET_HOSTS: usize = MAX_HOSTS;

pub type SnapshotData = Vec<u8, SNAPSHOT_CAP>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeldInputJack {
    pub uuid: ModuleId,
    pub id: JackId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeldOutputJack {
    pub uuid: ModuleId,
    pub id: JackId,
    pub color: u16,
    pub addr: [u8; 4],
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalState {
    pub held_inputs: Vec<HeldInputJack, MAX_LOCAL_HELD>,
    pub held_outputs: Vec<HeldOutputJack, MAX_LOCAL_HELD>,
}

impl LocalState {
    pub fn first_held_input(&self) -> Option<&HeldInputJack> {
        self.held_inputs.first()
    }

    pub fn first_held_output(&self) -> Option<&HeldOutputJack> {
        self.held_outputs.first()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalPatchState {
    Idle,
    PatchEnabled,
    PatchToggled,
    Blocked,
}

/// A fully resolved connection: enough for the input side to reconnect
/// without a separate directory lookup, which is what lets a restored
/// preset reconnect jacks without waiting on a live heartbeat round trip.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PatchConnection {
    pub input_uuid: ModuleId,
    pub input_jack_id: JackId,
    pub output_uuid: ModuleId,
    pub output_jack_id: JackId,
    pub output_addr: [u8; 4],
    pub output_port: u16,
    pub output_color: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveUpdate {
    pub uuid: ModuleId,
    pub local_state: LocalState,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveHalt {
    pub uuid: ModuleId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveSnapshotRequest {
    pub uuid: ModuleId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveSnapshotResponse {
    pub uuid: ModuleId,
    pub data: SnapshotData,
    pub patched: Vec<PatchConnection, MAX_PATCHED>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveSetPreset {
    pub uuid: ModuleId,
    pub data: Vec<DirectiveSnapshotResponse, MAX_PRESET_HOSTS>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveSetInputJack {
    pub uuid: ModuleId,
    pub source: HeldOutputJack,
    pub connection: PatchConnection,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveSetOutputJack {
    pub uuid: ModuleId,
    pub source: HeldInputJack,
    pub connection: PatchConnection,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveHeartbeat {
    pub uuid: ModuleId,
    pub term: u64,
    pub iteration: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveHeartbeatResponse {
    pub uuid: ModuleId,
    pub term: u64,
    pub success: bool,
    pub iteration: Option<u32>,
    pub state: Option<LocalState>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveRequestVote {
    pub uuid: ModuleId,
    pub term: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveRequestVoteResponse {
    pub uuid: ModuleId,
    pub term: u64,
    pub voted_for: Option<ModuleId>,
    pub vote_granted: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DirectiveGlobalStateUpdate {
    pub uuid: ModuleId,
    pub patch_state: GlobalPatchState,
    pub input: Option<HeldInputJack>,
    pub output: Option<HeldOutputJack>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Update(DirectiveUpdate),
    Halt(DirectiveHalt),
    SnapshotRequest(DirectiveSnapshotRequest),
    SnapshotResponse(DirectiveSnapshotResponse),
    SetPreset(DirectiveSetPreset),
    SetInputJack(DirectiveSetInputJack),
    SetOutputJack(DirectiveSetOutputJack),
    Heartbeat(DirectiveHeartbeat),
    HeartbeatResponse(DirectiveHeartbeatResponse),
    RequestVote(DirectiveRequestVote),
    RequestVoteResponse(DirectiveRequestVoteResponse),
    GlobalStateUpdate(DirectiveGlobalStateUpdate),
}

pub fn encode<'a>(directive: &Directive, buf: &'a mut [u8]) -> Result<&'a [u8], Error> {
    postcard::to_slice(directive, buf).map_err(|_| Error::Parse)
}

pub fn decode(buf: &[u8]) -> Result<Directive, Error> {
    postcard::from_bytes(buf).map_err(|_| Error::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(s: &str) -> ModuleId {
        ModuleId::from(s)
    }

    #[test]
    fn round_trips_update() {
        let mut held_inputs = Vec::new();
        held_inputs
            .push(HeldInputJack { uuid: uuid("a"), id: 3 })
            .unwrap();
        let d = Directive::Update(DirectiveUpdate {
            uuid: uuid("a"),
            local_state: LocalState {
                held_inputs,
                held_outputs: Vec::new(),
            },
        });
        let mut buf = [0u8; 512];
        let encoded = encode(&d, &mut buf).unwrap();
        let decoded = decode(encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn round_trips_global_state_update() {
        let d = Directive::GlobalStateUpdate(DirectiveGlobalStateUpdate {
            uuid: uuid("leader"),
            patch_state: GlobalPatchState::PatchToggled,
            input: Some(HeldInputJack { uuid: uuid("a"), id: 1 }),
            output: Some(HeldOutputJack {
                uuid: uuid("b"),
                id: 2,
                color: 120,
                addr: [239, 0, 0, 5],
                port: 19991,
            }),
        });
        let mut buf = [0u8; 512];
        let encoded = encode(&d, &mut buf).unwrap();
        let decoded = decode(encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn round_trips_heartbeat_response_with_state() {
        let d = Directive::HeartbeatResponse(DirectiveHeartbeatResponse {
            uuid: uuid("follower"),
            term: 4,
            success: true,
            iteration: Some(7),
            state: Some(LocalState::default()),
        });
        let mut buf = [0u8; 512];
        let encoded = encode(&d, &mut buf).unwrap();
        let decoded = decode(encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        let buf = [0xffu8; 16];
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn round_trips_set_output_jack() {
        let d = Directive::SetOutputJack(DirectiveSetOutputJack {
            uuid: uuid("a"),
            source: HeldInputJack { uuid: uuid("b"), id: 1 },
            connection: PatchConnection {
                input_uuid: uuid("b"),
                input_jack_id: 1,
                output_uuid: uuid("a"),
                output_jack_id: 2,
                output_addr: [239, 0, 0, 5],
                output_port: 19991,
                output_color: 120,
            },
        });
        let mut buf = [0u8; 512];
        let encoded = encode(&d, &mut buf).unwrap();
        let decoded = decode(encoded).unwrap();
        assert_eq!(d, decoded);
    }
}
