//! Per-peer input timeline controllers.
//!
//! A controller owns the scratch inputs buffer and a role. The role is
//! chosen per (local peer, authority peer): the server consumes remote
//! inputs through [`ServerController`] (or collects its own through
//! [`AutonomousServerController`]), a client collects and sends through
//! [`PlayerController`], replays other peers through [`DollController`], and
//! falls back to [`NoNetController`] offline. Dispatch is a plain `match` on
//! the role variant.

mod doll;
mod nonet;
mod player;
mod remote;
mod server;

pub use doll::{DollController, DollSnapshot};
pub use nonet::NoNetController;
pub use player::PlayerController;
pub use remote::RemoteState;
pub use server::{AutonomousServerController, ServerController};

use crate::bit_array::BitArray;
use crate::config::SyncConfig;
use crate::data_buffer::DataBuffer;
use crate::frame::FrameIndex;
use crate::net::PeerId;
use crate::object::{ObjectRegistry, SceneHost};
use anyhow::{ensure, Result};
use bytes::Bytes;
use tracing::warn;

/// The input payload always starts with a single `has_data` metadata bit.
pub const INPUT_METADATA_BITS: u16 = 1;

/// Everything a controller needs from its surroundings for one call.
pub struct ControllerCtx<'a> {
    pub config: &'a SyncConfig,
    pub host: &'a mut dyn SceneHost,
    pub registry: &'a mut ObjectRegistry,
}

/// What a `process` call produced beyond simulation side effects.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// A freshly composed input datagram to send to the server, unreliable.
    pub input_packet: Option<Bytes>,
}

/// Strategy variants for how inputs are sourced, packed, transmitted and
/// consumed.
#[derive(Debug)]
pub enum ControllerRole {
    Null,
    Server(ServerController),
    AutonomousServer(AutonomousServerController),
    Player(PlayerController),
    Doll(DollController),
    NoNet(NoNetController),
}

/// Per-peer role-switched controller owning the current inputs buffer.
#[derive(Debug)]
pub struct PeerNetworkedController {
    authority_peer: PeerId,
    inputs_buffer: DataBuffer,
    role: ControllerRole,
    has_player_new_input: bool,
}

impl PeerNetworkedController {
    pub fn new(authority_peer: PeerId) -> Self {
        Self {
            authority_peer,
            inputs_buffer: DataBuffer::new(),
            role: ControllerRole::Null,
            has_player_new_input: false,
        }
    }

    /// Picks the role for this controller given who the local peer is.
    pub fn assign_role(&mut self, local_peer: PeerId, local_is_server: bool, config: &SyncConfig) {
        self.role = if local_peer == crate::net::NO_PEER {
            ControllerRole::NoNet(NoNetController::new())
        } else if local_is_server {
            if self.authority_peer == local_peer {
                ControllerRole::AutonomousServer(AutonomousServerController::new(config))
            } else {
                ControllerRole::Server(ServerController::new(config))
            }
        } else if self.authority_peer == local_peer {
            ControllerRole::Player(PlayerController::new())
        } else {
            ControllerRole::Doll(DollController::new())
        };
    }

    pub fn authority_peer(&self) -> PeerId {
        self.authority_peer
    }

    pub fn role(&self) -> &ControllerRole {
        &self.role
    }

    pub fn is_networking_initialized(&self) -> bool {
        !matches!(self.role, ControllerRole::Null)
    }

    pub fn is_server_controller(&self) -> bool {
        matches!(
            self.role,
            ControllerRole::Server(_) | ControllerRole::AutonomousServer(_)
        )
    }

    pub fn is_player_controller(&self) -> bool {
        matches!(self.role, ControllerRole::Player(_))
    }

    pub fn is_doll_controller(&self) -> bool {
        matches!(self.role, ControllerRole::Doll(_))
    }

    pub fn is_nonet_controller(&self) -> bool {
        matches!(self.role, ControllerRole::NoNet(_))
    }

    pub fn inputs_buffer(&self) -> &DataBuffer {
        &self.inputs_buffer
    }

    pub fn inputs_buffer_mut(&mut self) -> &mut DataBuffer {
        &mut self.inputs_buffer
    }

    pub fn current_frame_index(&self) -> FrameIndex {
        match &self.role {
            ControllerRole::Null => FrameIndex::NONE,
            ControllerRole::Server(c) => c.remote.current_input_buffer_id,
            ControllerRole::AutonomousServer(c) => c.server.remote.current_input_buffer_id,
            ControllerRole::Player(c) => c.current_frame_index(),
            ControllerRole::Doll(c) => c.remote.current_input_buffer_id,
            ControllerRole::NoNet(c) => c.current_frame_index(),
        }
    }

    pub fn player_has_new_input(&self) -> bool {
        self.has_player_new_input
    }

    /// Whether this controller has anything to simulate this frame.
    pub fn can_simulate(&self, registry: &ObjectRegistry) -> bool {
        let mut controlled = registry.controlled_by(self.authority_peer).peekable();
        match &self.role {
            ControllerRole::Null => false,
            ControllerRole::Doll(_) | ControllerRole::NoNet(_) => {
                controlled.any(|object| object.realtime_sync_enabled_on_client)
            }
            _ => controlled.peek().is_some(),
        }
    }

    /// Advances the controller one fixed step.
    pub fn process(&mut self, delta: f32, ctx: &mut ControllerCtx) -> ProcessOutcome {
        let authority = self.authority_peer;
        let mut outcome = ProcessOutcome::default();
        self.has_player_new_input = false;
        match &mut self.role {
            ControllerRole::Null => {}
            ControllerRole::Server(c) => c.process(authority, &mut self.inputs_buffer, delta, ctx),
            ControllerRole::AutonomousServer(c) => {
                c.process(authority, &mut self.inputs_buffer, delta, ctx)
            }
            ControllerRole::Player(c) => {
                let (packet, new_input) = c.process(authority, &mut self.inputs_buffer, delta, ctx);
                outcome.input_packet = packet;
                self.has_player_new_input = new_input;
            }
            ControllerRole::Doll(c) => c.process(authority, &mut self.inputs_buffer, delta, ctx),
            ControllerRole::NoNet(c) => c.process(authority, &mut self.inputs_buffer, delta, ctx),
        }
        outcome
    }

    /// Feeds a received input datagram into the timeline. Returns `true`
    /// when the packet parsed cleanly.
    pub fn receive_inputs(&mut self, data: &[u8], now_ms: u32, ctx: &mut ControllerCtx) -> bool {
        let authority = self.authority_peer;
        match &mut self.role {
            ControllerRole::Server(c) => c.receive_inputs(authority, data, now_ms, ctx.host),
            ControllerRole::Doll(c) => c.receive_inputs(authority, data, now_ms, ctx.host),
            ControllerRole::AutonomousServer(_) => {
                warn!(authority, "receive_inputs called on an autonomous server controller");
                false
            }
            _ => {
                warn!(authority, "receive_inputs called on a controller that never receives");
                false
            }
        }
    }

    pub fn server_controller(&self) -> Option<&ServerController> {
        match &self.role {
            ControllerRole::Server(c) => Some(c),
            ControllerRole::AutonomousServer(c) => Some(&c.server),
            _ => None,
        }
    }

    pub fn server_controller_mut(&mut self) -> Option<&mut ServerController> {
        match &mut self.role {
            ControllerRole::Server(c) => Some(c),
            ControllerRole::AutonomousServer(c) => Some(&mut c.server),
            _ => None,
        }
    }

    pub fn player_controller(&self) -> Option<&PlayerController> {
        match &self.role {
            ControllerRole::Player(c) => Some(c),
            _ => None,
        }
    }

    pub fn player_controller_mut(&mut self) -> Option<&mut PlayerController> {
        match &mut self.role {
            ControllerRole::Player(c) => Some(c),
            _ => None,
        }
    }

    pub fn doll_controller(&self) -> Option<&DollController> {
        match &self.role {
            ControllerRole::Doll(c) => Some(c),
            _ => None,
        }
    }

    pub fn doll_controller_mut(&mut self) -> Option<&mut DollController> {
        match &mut self.role {
            ControllerRole::Doll(c) => Some(c),
            _ => None,
        }
    }

    /// Server-side: records that `peer` consumes this controller's inputs
    /// through a doll, so every parsed packet must be echoed to it.
    pub fn server_set_peer_simulating_this_controller(&mut self, peer: PeerId, simulating: bool) {
        let Some(server) = self.server_controller_mut() else {
            warn!("server_set_peer_simulating_this_controller on a non-server controller");
            return;
        };
        if simulating {
            if !server.peers_simulating_this_controller.contains(&peer) {
                server.peers_simulating_this_controller.push(peer);
            }
        } else {
            server.peers_simulating_this_controller.retain(|p| *p != peer);
        }
    }

    pub fn server_is_peer_simulating_this_controller(&self, peer: PeerId) -> bool {
        self.server_controller()
            .map(|server| server.peers_simulating_this_controller.contains(&peer))
            .unwrap_or(false)
    }

    /// Server-side: peer connect/disconnect/enable toggles reset the
    /// timeline.
    pub fn on_peer_status_updated(&mut self, enabled: bool) {
        if let Some(server) = self.server_controller_mut() {
            server.on_peer_update(enabled);
        }
    }
}

/// Replaces the controller inputs buffer content with a stored payload.
pub(crate) fn load_payload(
    inputs_buffer: &mut DataBuffer,
    payload: &BitArray,
    payload_bit_size: u16,
) {
    *inputs_buffer.buffer_mut() = payload.clone();
    inputs_buffer.shrink_to(
        INPUT_METADATA_BITS as u32,
        payload_bit_size.saturating_sub(INPUT_METADATA_BITS) as u32,
    );
}

/// Decodes an input datagram.
///
/// ```text
/// u32 first_input_id
/// repeat until end:
///    u8  duplication_count      // repeated (duplication_count + 1) times
///    bits input_payload         // metadata bit + counted payload, padded
///                               // up to a whole byte
/// ```
///
/// The callback receives `(input_id, payload_bit_size, payload)` for every
/// contained input, duplication expanded. A malformed packet aborts with an
/// error before any callback past the corruption point runs.
pub fn parse_input_packet(
    authority: PeerId,
    data: &[u8],
    host: &dyn SceneHost,
    mut on_input: impl FnMut(FrameIndex, u16, &BitArray),
) -> Result<()> {
    let data_len = data.len();
    ensure!(data_len >= 4, "input packet shorter than its header");
    let first_input_id = FrameIndex(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));

    let mut ofs = 4usize;
    let mut inserted_input_count = 0u32;

    // The reader spans the whole packet; it is re-seeked per input so the
    // payload bytes are never copied just to be counted.
    let mut pir = DataBuffer::from_bytes(data.to_vec());

    while ofs < data_len {
        let duplication = data[ofs];
        ofs += 1;

        let input_offset_bits = ofs as u32 * 8;
        ensure!(ofs < data_len, "input packet truncated at the payload");
        pir.shrink_to(input_offset_bits, (data_len - ofs) as u32 * 8);
        pir.begin_read();
        pir.seek(input_offset_bits);
        let has_data = pir.read_bool();
        ensure!(!pir.is_buffer_failed(), "input packet truncated at the metadata bit");

        let counted_bits = if has_data {
            host.count_input_size(authority, &mut pir)
        } else {
            0
        };
        let input_size_in_bits = counted_bits + INPUT_METADATA_BITS;
        ensure!(
            !pir.is_buffer_failed(),
            "input packet payload smaller than its declared content"
        );

        let input_size_padded = (input_size_in_bits as usize).div_ceil(8);
        ensure!(
            ofs + input_size_padded <= data_len,
            "input packet size does not match its content"
        );

        let payload = BitArray::from_bytes(data[ofs..ofs + input_size_padded].to_vec());
        for _ in 0..=duplication {
            let input_id = first_input_id + inserted_input_count;
            inserted_input_count += 1;
            on_input(input_id, input_size_in_bits, &payload);
        }

        ofs += input_size_padded;
    }

    ensure!(ofs == data_len, "input packet has trailing bytes");
    Ok(())
}
