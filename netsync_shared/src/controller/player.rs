//! Local authority on a client: collects inputs, simulates speculatively,
//! and ships the recent input window to the server.

use super::{ControllerCtx, INPUT_METADATA_BITS};
use crate::bit_array::BitArray;
use crate::data_buffer::DataBuffer;
use crate::frame::{FrameIndex, FrameInput};
use crate::net::PeerId;
use crate::object::SceneHost;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Default)]
pub struct PlayerController {
    current_input_id: FrameIndex,
    input_buffers_counter: u32,
    streaming_paused: bool,
    frames_input: VecDeque<FrameInput>,
    queued_instant_to_process: Option<usize>,
}

impl PlayerController {
    pub fn new() -> Self {
        Self {
            current_input_id: FrameIndex::NONE,
            ..Default::default()
        }
    }

    pub fn current_frame_index(&self) -> FrameIndex {
        self.current_input_id
    }

    pub fn frames_count(&self) -> usize {
        self.frames_input.len()
    }

    pub fn count_frames_after(&self, frame_index: FrameIndex) -> usize {
        self.frames_input.iter().filter(|f| f.id > frame_index).count()
    }

    pub fn last_known_frame_index(&self) -> FrameIndex {
        self.frames_input
            .back()
            .map(|f| f.id)
            .unwrap_or(FrameIndex::NONE)
    }

    pub fn stored_frame_index(&self, i: usize) -> FrameIndex {
        self.frames_input
            .get(i)
            .map(|f| f.id)
            .unwrap_or(FrameIndex::NONE)
    }

    pub fn is_streaming_paused(&self) -> bool {
        self.streaming_paused
    }

    /// Drops stored inputs at or before the server-confirmed frame. The
    /// confirmed input itself decides whether the stream may stay paused,
    /// and any retained non-empty input lifts the pause.
    pub fn notify_frame_checked(&mut self, frame_index: FrameIndex) {
        if frame_index.is_none() {
            return;
        }

        while let Some(front) = self.frames_input.front() {
            if front.id > frame_index {
                break;
            }
            if front.id == frame_index {
                self.streaming_paused = front.is_empty(INPUT_METADATA_BITS);
            }
            self.frames_input.pop_front();
        }

        if self.streaming_paused
            && self
                .frames_input
                .iter()
                .any(|f| !f.is_empty(INPUT_METADATA_BITS))
        {
            self.streaming_paused = false;
        }
    }

    pub fn on_state_validated(&mut self, frame_index: FrameIndex, _desync_detected: bool) {
        self.notify_frame_checked(frame_index);
    }

    /// The reconciliation driver queues the stored input to replay for one
    /// rewind sub-step.
    pub fn on_rewind_frame_begin(
        &mut self,
        frame_index: FrameIndex,
        rewinding_index: usize,
        _rewinding_frame_count: usize,
    ) {
        if rewinding_index < self.frames_input.len() {
            debug_assert_eq!(self.frames_input[rewinding_index].id, frame_index);
            self.queued_instant_to_process = Some(rewinding_index);
        } else {
            self.queued_instant_to_process = None;
        }
    }

    pub fn has_another_instant_to_process_after(&self, i: usize) -> bool {
        i + 1 < self.frames_input.len()
    }

    pub fn can_accept_new_inputs(&self, max_storage: u32) -> bool {
        self.frames_input.len() < max_storage as usize
    }

    /// One fixed step. Returns the composed input datagram (when the stream
    /// is live) and whether a new input was stored this frame.
    pub fn process(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        ctx: &mut ControllerCtx,
    ) -> (Option<Bytes>, bool) {
        if let Some(instant) = self.queued_instant_to_process.take() {
            // The scene is rewinding: replay the stored input instead of
            // collecting a new one.
            let frame = &self.frames_input[instant];
            self.current_input_id = frame.id;
            let mut replay = DataBuffer::from_bit_array(frame.payload.clone());
            replay.shrink_to(
                INPUT_METADATA_BITS as u32,
                frame.payload_bit_size.saturating_sub(INPUT_METADATA_BITS) as u32,
            );
            replay.begin_read();
            replay.seek(INPUT_METADATA_BITS as u32);
            ctx.host.process(authority, delta, &mut replay);
            return (None, false);
        }

        // In case of a bad connection inputs can't accumulate forever,
        // otherwise the server would fall too far behind the client.
        let accept_new_inputs = self.can_accept_new_inputs(ctx.config.client_max_frames_storage_size);

        if accept_new_inputs {
            self.current_input_id = FrameIndex(self.input_buffers_counter);

            inputs_buffer.begin_write(INPUT_METADATA_BITS as u32);
            inputs_buffer.seek(INPUT_METADATA_BITS as u32);
            ctx.host.collect_input(authority, delta, inputs_buffer);

            // Set the metadata bit.
            inputs_buffer.seek(0);
            if inputs_buffer.size() > 0 {
                inputs_buffer.add_bool(true);
                self.streaming_paused = false;
            } else {
                inputs_buffer.add_bool(false);
            }
        } else {
            warn!(authority, "can't accept new inputs, is the connection lagging?");
        }

        inputs_buffer.dry();
        inputs_buffer.begin_read();
        inputs_buffer.seek(INPUT_METADATA_BITS as u32);
        // The process hook always runs: the character keeps moving even when
        // the input was not stored.
        ctx.host.process(authority, delta, inputs_buffer);

        let mut stored_new_input = false;
        let mut packet = None;
        if !self.streaming_paused {
            if accept_new_inputs {
                self.input_buffers_counter += 1;
                self.store_input_buffer(self.current_input_id, inputs_buffer);
                stored_new_input = true;
            }
            // Keep sending inputs even when the server seems unresponsive,
            // so it becomes up to date at some point.
            packet = Some(self.build_input_packet(authority, ctx.config.max_redundant_inputs, ctx.host));
        }
        (packet, stored_new_input)
    }

    fn store_input_buffer(&mut self, frame_index: FrameIndex, inputs_buffer: &DataBuffer) {
        self.frames_input.push_back(FrameInput {
            id: frame_index,
            payload: inputs_buffer.buffer().clone(),
            payload_bit_size: (inputs_buffer.size() + INPUT_METADATA_BITS as u32) as u16,
            similarity: FrameIndex::NONE,
            received_at_ms: u32::MAX,
        });
    }

    /// Composes the unreliable datagram with the last
    /// `min(stored, max_redundant_inputs + 1)` inputs, folding adjacent
    /// equivalent inputs into a duplication count. Equivalence results are
    /// memoized through each input's `similarity` field.
    fn build_input_packet(
        &mut self,
        authority: PeerId,
        max_redundant_inputs: u32,
        host: &dyn SceneHost,
    ) -> Bytes {
        let inputs_count = self
            .frames_input
            .len()
            .min(max_redundant_inputs as usize + 1);
        debug_assert!(inputs_count >= 1);
        let start = self.frames_input.len() - inputs_count;

        let mut packet = BytesMut::new();
        packet.put_u32_le(self.frames_input[start].id.0);

        let mut previous_input_id = FrameIndex::NONE;
        let mut previous_input_similarity = FrameIndex::NONE;
        // Payload of the last input actually written, for the comparisons.
        let mut previous_payload: Option<(BitArray, u16)> = None;
        let mut duplication_count: u8 = 0;
        let mut duplication_count_at = 0usize;

        for i in start..self.frames_input.len() {
            let is_similar = if previous_input_id.is_none() {
                // First input of the packet, just write it.
                false
            } else if duplication_count == u8::MAX {
                false
            } else if self.frames_input[i].similarity != previous_input_id {
                if self.frames_input[i].similarity.is_none() {
                    // Never compared; do it now against the last written one.
                    let (prev_payload, prev_bits) =
                        previous_payload.as_ref().expect("an input was written");
                    let frame = &self.frames_input[i];
                    !are_payloads_different(
                        authority,
                        host,
                        prev_payload,
                        *prev_bits,
                        &frame.payload,
                        frame.payload_bit_size,
                    )
                } else {
                    // The similarity check was done against an older input;
                    // the cached ids still decide it.
                    self.frames_input[i].similarity == previous_input_similarity
                }
            } else {
                // Cached as equivalent to the previous one.
                true
            };

            if is_similar {
                duplication_count += 1;
                // Memoize so these frames are never compared again.
                self.frames_input[i].similarity = previous_input_id;
            } else {
                // Finalize the previous entry and start a new one.
                if !previous_input_id.is_none() {
                    packet[duplication_count_at] = duplication_count;
                }
                duplication_count = 0;
                duplication_count_at = packet.len();
                packet.put_u8(0);

                let frame = &self.frames_input[i];
                packet.extend_from_slice(frame.payload.bytes());

                previous_input_id = frame.id;
                previous_input_similarity = frame.similarity;
                previous_payload = Some((frame.payload.clone(), frame.payload_bit_size));
            }
        }

        packet[duplication_count_at] = duplication_count;
        packet.freeze()
    }
}

fn are_payloads_different(
    authority: PeerId,
    host: &dyn SceneHost,
    a: &BitArray,
    a_bits: u16,
    b: &BitArray,
    b_bits: u16,
) -> bool {
    let mut da = DataBuffer::from_bit_array(a.clone());
    da.shrink_to(
        INPUT_METADATA_BITS as u32,
        a_bits.saturating_sub(INPUT_METADATA_BITS) as u32,
    );
    da.begin_read();
    da.seek(INPUT_METADATA_BITS as u32);

    let mut db = DataBuffer::from_bit_array(b.clone());
    db.shrink_to(
        INPUT_METADATA_BITS as u32,
        b_bits.saturating_sub(INPUT_METADATA_BITS) as u32,
    );
    db.begin_read();
    db.seek(INPUT_METADATA_BITS as u32);

    host.are_inputs_different(authority, &mut da, &mut db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::controller::parse_input_packet;
    use crate::data_buffer::Level3;
    use crate::object::{ObjectLocalId, ObjectRegistry, VarData};

    /// Host producing a scripted u8 input per call.
    struct ScriptedHost {
        script: Vec<u8>,
        cursor: std::cell::Cell<usize>,
    }

    impl ScriptedHost {
        fn new(script: Vec<u8>) -> Self {
            Self {
                script,
                cursor: std::cell::Cell::new(0),
            }
        }
    }

    impl SceneHost for ScriptedHost {
        fn get_var(&self, _object: ObjectLocalId, _var: &str) -> Option<VarData> {
            None
        }
        fn set_var(&mut self, _object: ObjectLocalId, _var: &str, _value: &VarData) {}
        fn collect_input(&mut self, _peer: PeerId, _delta: f32, buf: &mut DataBuffer) {
            let i = self.cursor.get();
            self.cursor.set(i + 1);
            let value = self.script.get(i).copied().unwrap_or(0);
            if value != 0 {
                buf.add_uint(value as u64, Level3);
            }
        }
        fn count_input_size(&self, _peer: PeerId, buf: &mut DataBuffer) -> u16 {
            buf.skip_uint(Level3);
            DataBuffer::uint_size(Level3) as u16
        }
        fn are_inputs_different(
            &self,
            _peer: PeerId,
            a: &mut DataBuffer,
            b: &mut DataBuffer,
        ) -> bool {
            let av = if a.size() > 0 { a.read_uint(Level3) } else { 0 };
            let bv = if b.size() > 0 { b.read_uint(Level3) } else { 0 };
            av != bv
        }
        fn process(&mut self, _peer: PeerId, _delta: f32, _input: &mut DataBuffer) {}
    }

    fn run_frames(
        controller: &mut PlayerController,
        host: &mut ScriptedHost,
        frames: usize,
    ) -> Vec<Option<Bytes>> {
        let config = SyncConfig::default();
        let mut registry = ObjectRegistry::new();
        let mut inputs_buffer = DataBuffer::new();
        let mut packets = Vec::new();
        for _ in 0..frames {
            let mut ctx = ControllerCtx {
                config: &config,
                host: &mut *host,
                registry: &mut registry,
            };
            let (packet, _) = controller.process(2, &mut inputs_buffer, 1.0 / 60.0, &mut ctx);
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn input_ids_are_strictly_monotone() {
        let mut controller = PlayerController::new();
        let mut host = ScriptedHost::new(vec![1, 2, 3, 4, 5]);
        run_frames(&mut controller, &mut host, 5);
        let ids: Vec<u32> = controller.frames_input.iter().map(|f| f.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(controller.current_frame_index(), FrameIndex(4));
    }

    #[test]
    fn packet_roundtrips_with_duplication_folding() {
        let mut controller = PlayerController::new();
        // Three identical inputs then a different one.
        let mut host = ScriptedHost::new(vec![7, 7, 7, 9]);
        let packets = run_frames(&mut controller, &mut host, 4);
        let last = packets[3].as_ref().unwrap();

        // The three 7s fold into one entry with duplication_count 2.
        let mut seen = Vec::new();
        parse_input_packet(2, last, &host, |id, _bits, _payload| seen.push(id.0)).unwrap();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        // 4 header bytes + (1 dup byte + 2 payload bytes) * 2 distinct inputs.
        assert_eq!(last.len(), 4 + 3 + 3);
    }

    #[test]
    fn redundancy_window_is_bounded() {
        let mut controller = PlayerController::new();
        let mut host = ScriptedHost::new((1..=20).collect());
        let packets = run_frames(&mut controller, &mut host, 20);
        let last = packets[19].as_ref().unwrap();

        let mut seen = Vec::new();
        parse_input_packet(2, last, &host, |id, _bits, _payload| seen.push(id.0)).unwrap();
        // max_redundant_inputs defaults to 6: the window carries 7 inputs.
        assert_eq!(seen, vec![13, 14, 15, 16, 17, 18, 19]);
    }

    #[test]
    fn zero_payload_pauses_the_stream() {
        let mut controller = PlayerController::new();
        // One real input, then silence.
        let mut host = ScriptedHost::new(vec![5, 0, 0, 0]);
        let packets = run_frames(&mut controller, &mut host, 4);

        assert!(packets[0].is_some());
        // The empty input is still sent once so the server learns about the
        // pause...
        assert!(packets[1].is_some());
        // ...then the server confirms it and sending stops.
        controller.notify_frame_checked(FrameIndex(1));
        assert!(controller.is_streaming_paused());
        let mut host2 = ScriptedHost::new(vec![0, 0]);
        let more = run_frames(&mut controller, &mut host2, 2);
        assert!(more[0].is_none());
        assert!(more[1].is_none());
    }

    #[test]
    fn stream_resumes_on_real_input() {
        let mut controller = PlayerController::new();
        controller.streaming_paused = true;
        let mut host = ScriptedHost::new(vec![3]);
        let packets = run_frames(&mut controller, &mut host, 1);
        assert!(!controller.is_streaming_paused());
        assert!(packets[0].is_some());
    }

    #[test]
    fn storage_cap_skips_collection() {
        let mut controller = PlayerController::new();
        let mut host = ScriptedHost::new((1..=40).collect());
        run_frames(&mut controller, &mut host, 40);
        let cap = SyncConfig::default().client_max_frames_storage_size as usize;
        assert_eq!(controller.frames_count(), cap);
        // The counter only advanced for the stored inputs.
        assert_eq!(controller.current_frame_index(), FrameIndex(cap as u32 - 1));
    }

    #[test]
    fn notify_frame_checked_drops_acknowledged() {
        let mut controller = PlayerController::new();
        let mut host = ScriptedHost::new(vec![1, 2, 3, 4, 5]);
        run_frames(&mut controller, &mut host, 5);
        controller.notify_frame_checked(FrameIndex(2));
        let ids: Vec<u32> = controller.frames_input.iter().map(|f| f.id.0).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn rewind_replays_the_stored_input() {
        let mut controller = PlayerController::new();
        let mut host = ScriptedHost::new(vec![1, 2, 3]);
        run_frames(&mut controller, &mut host, 3);

        controller.on_rewind_frame_begin(FrameIndex(1), 1, 3);
        assert_eq!(controller.queued_instant_to_process, Some(1));

        let mut host2 = ScriptedHost::new(vec![]);
        run_frames(&mut controller, &mut host2, 1);
        // The replay consumed the queued instant without collecting.
        assert_eq!(controller.queued_instant_to_process, None);
        assert_eq!(controller.current_frame_index(), FrameIndex(1));
        assert_eq!(controller.frames_count(), 3);
    }
}
