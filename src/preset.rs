//! Preset capture/restore: pure helpers over the `SetPreset` wire bundle.
//!
//! A preset is a `Vec<SnapshotResponse>`, one entry per participating
//! module, each carrying that module's opaque `get_snapshot()` blob plus the
//! `PatchConnection`s its inputs were subscribed to at capture time (§4.7,
//! grounded on `original_source/brain/protocol.py`'s `SnapshotResponse`/
//! `SetPreset` and `interfaces.py`'s `get_snapshot`/`set_snapshot`). The
//! teacher's Rust revision never restored this subsystem; these helpers and
//! `Module::apply_set_preset` (in `lib.rs`, alongside the crate's other
//! directive handlers) restore it.
//!
//! Reconstructing the whole patch graph only requires the input side of
//! each connection (§4.2's `patch_connections`), since a connection is
//! symmetric — so these helpers only ever look at `patched` entries by
//! `input_uuid`/`output_uuid`, never needing a separate output-side record.

use crate::directive::{DirectiveSetPreset, DirectiveSnapshotResponse, PatchConnection, MAX_PRESET_HOSTS};
use crate::ModuleId;
use heapless::Vec;

/// In-progress capture buffer: one [`DirectiveSnapshotResponse`] per module
/// that has replied since the fabric module's last `request_snapshot` call.
/// A later response from an already-recorded module replaces its entry, so
/// a capture is idempotent under duplicate or retransmitted
/// `SnapshotResponse`s.
pub(crate) fn record_response(
    buf: &mut Vec<DirectiveSnapshotResponse, MAX_PRESET_HOSTS>,
    response: DirectiveSnapshotResponse,
) {
    if let Some(existing) = buf.iter_mut().find(|r| r.uuid == response.uuid) {
        *existing = response;
        return;
    }
    if buf.len() >= MAX_PRESET_HOSTS {
        buf.swap_remove(0);
    }
    let _ = buf.push(response);
}

/// The bundle entry carrying this module's own snapshot, if the preset
/// names it. `None` means this module was not part of the capture — the
/// caller should clear its jacks rather than try to partially reconcile.
pub(crate) fn own_snapshot<'a>(
    preset: &'a DirectiveSetPreset,
    uuid: &ModuleId,
) -> Option<&'a DirectiveSnapshotResponse> {
    preset.data.iter().find(|resp| &resp.uuid == uuid)
}

/// Every `PatchConnection` across the whole bundle whose input side is
/// `uuid`, i.e. the connections this module's inputs should hold once the
/// preset is applied.
pub(crate) fn connections_into<'a>(
    preset: &'a DirectiveSetPreset,
    uuid: &'a ModuleId,
) -> impl Iterator<Item = &'a PatchConnection> {
    preset
        .data
        .iter()
        .flat_map(|resp| resp.patched.iter())
        .filter(move |c| &c.input_uuid == uuid)
}

/// Every `PatchConnection` across the whole bundle whose output side is
/// `uuid`, i.e. the subscribers this module's outputs should carry once the
/// preset is applied.
pub(crate) fn connections_out_of<'a>(
    preset: &'a DirectiveSetPreset,
    uuid: &'a ModuleId,
) -> impl Iterator<Item = &'a PatchConnection> {
    preset
        .data
        .iter()
        .flat_map(|resp| resp.patched.iter())
        .filter(move |c| &c.output_uuid == uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::MAX_PATCHED;
    use heapless::Vec;

    fn uuid(s: &str) -> ModuleId {
        ModuleId::from(s)
    }

    fn connection(input: &str, in_id: u32, output: &str, out_id: u32) -> PatchConnection {
        PatchConnection {
            input_uuid: uuid(input),
            input_jack_id: in_id,
            output_uuid: uuid(output),
            output_jack_id: out_id,
            output_addr: [239, 0, 0, 5],
            output_port: 19991,
            output_color: 120,
        }
    }

    #[test]
    fn record_response_replaces_same_sender_rather_than_duplicating() {
        let mut buf: Vec<DirectiveSnapshotResponse, MAX_PRESET_HOSTS> = Vec::new();
        record_response(
            &mut buf,
            DirectiveSnapshotResponse {
                uuid: uuid("a"),
                data: Vec::new(),
                patched: Vec::new(),
            },
        );
        let mut data = Vec::new();
        data.push(7u8).unwrap();
        record_response(
            &mut buf,
            DirectiveSnapshotResponse {
                uuid: uuid("a"),
                data,
                patched: Vec::new(),
            },
        );
        assert_eq!(buf.len(), 1);
        assert_eq!(buf[0].data.as_slice(), &[7u8]);
    }

    #[test]
    fn own_snapshot_finds_matching_entry_only() {
        let mut patched: Vec<PatchConnection, MAX_PATCHED> = Vec::new();
        patched.push(connection("b", 1, "a", 2)).unwrap();
        let mut data = Vec::new();
        data.push(DirectiveSnapshotResponse {
            uuid: uuid("a"),
            data: Vec::new(),
            patched,
        })
        .unwrap();
        let preset = DirectiveSetPreset { uuid: uuid("leader"), data };

        assert!(own_snapshot(&preset, &uuid("a")).is_some());
        assert!(own_snapshot(&preset, &uuid("b")).is_none());
    }

    #[test]
    fn connections_are_filtered_by_side() {
        let mut patched: Vec<PatchConnection, MAX_PATCHED> = Vec::new();
        patched.push(connection("b", 1, "a", 2)).unwrap();
        let mut data = Vec::new();
        data.push(DirectiveSnapshotResponse {
            uuid: uuid("a"),
            data: Vec::new(),
            patched,
        })
        .unwrap();
        let preset = DirectiveSetPreset { uuid: uuid("leader"), data };

        assert_eq!(connections_into(&preset, &uuid("b")).count(), 1);
        assert_eq!(connections_into(&preset, &uuid("a")).count(), 0);
        assert_eq!(connections_out_of(&preset, &uuid("a")).count(), 1);
        assert_eq!(connections_out_of(&preset, &uuid("b")).count(), 0);
    }
}
