//! Server-side consumption of a remote authority's input stream.

use super::remote::RemoteState;
use super::{parse_input_packet, ControllerCtx, INPUT_METADATA_BITS};
use crate::config::SyncConfig;
use crate::data_buffer::DataBuffer;
use crate::net::PeerId;
use crate::object::SceneHost;
use crate::stats::SampleRing;
use tracing::{debug, warn};

/// Remote authority on the server: consumes queued inputs in frame order,
/// watches the stream health, and computes the tick-rate feedback for the
/// owning client.
#[derive(Debug)]
pub struct ServerController {
    pub remote: RemoteState,
    /// Peers whose dolls replay this controller's inputs; every parsed
    /// packet is echoed to them.
    pub peers_simulating_this_controller: Vec<PeerId>,
    /// Ring of "extra milliseconds past one frame" between consecutive
    /// received inputs.
    network_watcher: SampleRing,
    /// Ring of how many contiguous inputs sat in the deque each frame.
    consecutive_input_watcher: SampleRing,
    previous_frame_received_timestamp: u32,
}

impl ServerController {
    pub fn new(config: &SyncConfig) -> Self {
        let traced = config.network_traced_frames as usize;
        Self {
            remote: RemoteState::default(),
            peers_simulating_this_controller: Vec::new(),
            network_watcher: SampleRing::new(traced, 0),
            consecutive_input_watcher: SampleRing::new(traced, 0),
            previous_frame_received_timestamp: u32::MAX,
        }
    }

    pub fn on_peer_update(&mut self, peer_enabled: bool) {
        if self.remote.on_peer_update(peer_enabled) {
            self.previous_frame_received_timestamp = u32::MAX;
            self.network_watcher.reset(0);
            self.consecutive_input_watcher.reset(0);
        }
    }

    pub fn process(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        ctx: &mut ControllerCtx,
    ) {
        let fetch = self
            .remote
            .fetch_next_input(authority, inputs_buffer, ctx.host);

        if let Some((received_at_ms, first)) = fetch.accepted {
            self.track_network_time(received_at_ms, first, ctx.config.fixed_frame_delta_ms());
        }

        self.remote
            .process_consumed_input(authority, inputs_buffer, delta, ctx.host);

        // Once an empty input is consumed the client is allowed to pause its
        // stream; further missing inputs count as void, not as ghosts.
        if !self.remote.current_input_buffer_id.is_none() && inputs_buffer.size() == 0 {
            self.remote.streaming_paused = true;
        }

        if !self.remote.streaming_paused {
            let mut consecutive_inputs = 0u32;
            for frame in &self.remote.frames_input {
                if frame.id == self.remote.current_input_buffer_id + consecutive_inputs + 1 {
                    consecutive_inputs += 1;
                }
            }
            self.consecutive_input_watcher.push(consecutive_inputs);
        }
    }

    fn track_network_time(&mut self, received_at_ms: u32, first: bool, frame_delta_ms: u32) {
        if self.previous_frame_received_timestamp < received_at_ms {
            let receival_time = received_at_ms - self.previous_frame_received_timestamp;
            let network_time = receival_time.saturating_sub(frame_delta_ms);
            self.network_watcher.push(network_time);
        }
        if first {
            self.network_watcher.reset(0);
            self.consecutive_input_watcher.reset(0);
            self.previous_frame_received_timestamp = u32::MAX;
        } else {
            self.previous_frame_received_timestamp = received_at_ms;
        }
    }

    pub fn receive_inputs(
        &mut self,
        authority: PeerId,
        data: &[u8],
        now_ms: u32,
        host: &dyn SceneHost,
    ) -> bool {
        let remote = &mut self.remote;
        let drop_at_or_before = remote.current_input_buffer_id;
        let parsed = parse_input_packet(authority, data, host, |id, bit_size, payload| {
            remote.insert_input(id, bit_size, payload, now_ms, drop_at_or_before);
        });
        if let Err(error) = parsed {
            debug!(authority, %error, "input packet dropped");
            return false;
        }
        true
    }

    /// How many frames the client should stay ahead, from the worst
    /// inter-arrival time observed in the traced window, minus a 5% frame
    /// tolerance, clamped to the configured delay band.
    pub fn compute_client_tick_rate_distance_to_optimal(&self, config: &SyncConfig) -> i8 {
        let worst_receival_time_ms = self.network_watcher.max();
        let worst_receival_time = worst_receival_time_ms as f64 / 1000.0;
        let fixed_frame_delta = config.fixed_frame_delta as f64;

        let optimal_frame_delay_unclamped =
            (worst_receival_time / fixed_frame_delta - 0.05).ceil() as i64;
        let optimal_frame_delay = optimal_frame_delay_unclamped
            .clamp(config.min_frames_delay as i64, config.max_frames_delay as i64);

        let consecutive_inputs = self.consecutive_input_watcher.average_rounded() as i64;

        (optimal_frame_delay - consecutive_inputs).clamp(i8::MIN as i64, i8::MAX as i64) as i8
    }
}

/// The server hosting the authoritative player: same shape as
/// [`ServerController`], but the inputs are collected locally and nothing
/// ever arrives from the network.
#[derive(Debug)]
pub struct AutonomousServerController {
    pub server: ServerController,
}

impl AutonomousServerController {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            server: ServerController::new(config),
        }
    }

    pub fn process(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        ctx: &mut ControllerCtx,
    ) {
        inputs_buffer.begin_write(INPUT_METADATA_BITS as u32);
        inputs_buffer.seek(INPUT_METADATA_BITS as u32);
        ctx.host.collect_input(authority, delta, inputs_buffer);
        inputs_buffer.dry();

        let remote = &mut self.server.remote;
        remote.current_input_buffer_id = if remote.current_input_buffer_id.is_none() {
            crate::frame::FrameIndex(0)
        } else {
            remote.current_input_buffer_id + 1
        };

        remote.process_consumed_input(authority, inputs_buffer, delta, ctx.host);
    }

    pub fn receive_inputs(&mut self, authority: PeerId) -> bool {
        warn!(
            authority,
            "receive_inputs called on an autonomous server controller; the server collects its own"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameIndex;

    #[test]
    fn tick_rate_distance_tracks_the_worst_arrival() {
        let config = SyncConfig::default();
        let mut controller = ServerController::new(&config);

        // A worst arrival of 100 ms at 60 Hz asks for ~6 queued frames.
        controller.network_watcher.push(100);
        controller.consecutive_input_watcher.push(1);
        let distance = controller.compute_client_tick_rate_distance_to_optimal(&config);
        assert!(distance > 0, "client should be asked to speed up, got {distance}");
    }

    #[test]
    fn tick_rate_distance_is_negative_with_a_deep_queue() {
        let config = SyncConfig::default();
        let mut controller = ServerController::new(&config);
        controller.consecutive_input_watcher.reset(10);
        let distance = controller.compute_client_tick_rate_distance_to_optimal(&config);
        assert!(distance < 0, "client should be asked to slow down, got {distance}");
    }

    #[test]
    fn autonomous_controller_advances_every_tick() {
        let config = SyncConfig::default();
        let mut controller = AutonomousServerController::new(&config);
        let mut buffer = DataBuffer::new();
        let mut registry = crate::object::ObjectRegistry::new();
        let mut host = crate::controller::tests::ByteInputHost;
        let mut ctx = ControllerCtx {
            config: &config,
            host: &mut host,
            registry: &mut registry,
        };

        for expected in 0..4u32 {
            controller.process(1, &mut buffer, 1.0 / 60.0, &mut ctx);
            assert_eq!(
                controller.server.remote.current_input_buffer_id,
                FrameIndex(expected)
            );
        }
    }
}
