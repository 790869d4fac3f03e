//! State shared by the controllers that consume a remote input stream
//! (server and doll).

use super::{load_payload, INPUT_METADATA_BITS};
use crate::bit_array::BitArray;
use crate::data_buffer::DataBuffer;
use crate::frame::{FrameIndex, FrameInput};
use crate::net::PeerId;
use crate::object::SceneHost;
use std::collections::VecDeque;
use tracing::trace;

/// What `fetch_next_input` consumed, for the watchers layered on top.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchResult {
    pub is_new_input: bool,
    /// Set when an input was taken from the deque: its arrival timestamp and
    /// whether it was the first input of the stream.
    pub accepted: Option<(u32, bool)>,
}

/// Ordered deque of inputs received from an authority, plus the consumption
/// cursor.
#[derive(Debug)]
pub struct RemoteState {
    pub current_input_buffer_id: FrameIndex,
    pub ghost_input_count: u32,
    pub frames_input: VecDeque<FrameInput>,
    /// The stream is paused when the authority sends an empty buffer.
    pub streaming_paused: bool,
    pub peer_enabled: bool,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            current_input_buffer_id: FrameIndex::NONE,
            ghost_input_count: 0,
            frames_input: VecDeque::new(),
            streaming_paused: false,
            peer_enabled: false,
        }
    }
}

impl RemoteState {
    pub fn last_known_frame_index(&self) -> FrameIndex {
        self.frames_input
            .back()
            .map(|f| f.id)
            .unwrap_or(FrameIndex::NONE)
    }

    pub fn inputs_count(&self) -> usize {
        self.frames_input.len()
    }

    /// Peer enable toggles reset the timeline so stale data never leaks into
    /// a fresh session.
    pub fn on_peer_update(&mut self, peer_enabled: bool) -> bool {
        if peer_enabled == self.peer_enabled {
            return false;
        }
        self.peer_enabled = peer_enabled;
        self.ghost_input_count = 0;
        self.frames_input.clear();
        true
    }

    /// Inserts a parsed input, keeping the deque sorted by id and dropping
    /// both duplicates and anything at or before `drop_at_or_before`.
    pub fn insert_input(
        &mut self,
        id: FrameIndex,
        payload_bit_size: u16,
        payload: &BitArray,
        received_at_ms: u32,
        drop_at_or_before: FrameIndex,
    ) {
        if !drop_at_or_before.is_none() && id <= drop_at_or_before {
            return;
        }
        match self.frames_input.binary_search_by(|f| f.id.cmp(&id)) {
            Ok(_) => {} // already known
            Err(at) => self.frames_input.insert(
                at,
                FrameInput {
                    id,
                    payload: payload.clone(),
                    payload_bit_size,
                    similarity: FrameIndex::NONE,
                    received_at_ms,
                },
            ),
        }
    }

    fn take_front(&mut self) -> FrameInput {
        self.frames_input.pop_front().expect("checked non-empty")
    }

    fn set_frame_input(
        &mut self,
        inputs_buffer: &mut DataBuffer,
        frame: &FrameInput,
        first: bool,
    ) -> FetchResult {
        load_payload(inputs_buffer, &frame.payload, frame.payload_bit_size);
        self.current_input_buffer_id = frame.id;
        FetchResult {
            is_new_input: true,
            accepted: Some((frame.received_at_ms, first)),
        }
    }

    /// Selects the input to consume this frame, the way the server does it:
    /// the next id when present, a replay of the previous input while the
    /// ghost budget lasts, then a forward skip to the first recovered input
    /// that matters.
    pub fn fetch_next_input(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        host: &dyn SceneHost,
    ) -> FetchResult {
        if self.current_input_buffer_id.is_none() {
            // As initial packet, anything is good.
            if !self.frames_input.is_empty() {
                let frame = self.take_front();
                return self.set_frame_input(inputs_buffer, &frame, true);
            }
            return FetchResult::default();
        }

        let next_input_id = self.current_input_buffer_id + 1;

        if self.streaming_paused {
            let head_ready = self
                .frames_input
                .front()
                .map(|f| f.id >= next_input_id)
                .unwrap_or(false);
            if head_ready {
                // A new input arrived while the stream was paused.
                let frame = self.take_front();
                self.streaming_paused = frame.is_empty(INPUT_METADATA_BITS);
                return self.set_frame_input(inputs_buffer, &frame, true);
            }
            // Not yet arrived; pretend the next input is void.
            load_payload(
                inputs_buffer,
                &BitArray::with_size_in_bits(INPUT_METADATA_BITS as u32),
                INPUT_METADATA_BITS,
            );
            return FetchResult::default();
        }

        if self.frames_input.is_empty() {
            // A packet is missing: replay the previous input.
            trace!(authority, next = %next_input_id, "input missing, using the previous one");
            self.ghost_input_count += 1;
            return FetchResult::default();
        }

        if self.frames_input.front().map(|f| f.id) == Some(next_input_id) {
            let frame = self.take_front();
            self.ghost_input_count = 0;
            return self.set_frame_input(inputs_buffer, &frame, false);
        }

        // The next input is not here. This can happen when the packet is
        // lost, late, or the client desynced. Initially the previous input
        // is replayed while `ghost_input_count` grows; each following frame
        // the search pool widens to `next + ghost_input_count`, and inputs
        // found there are skipped until one differs from the last consumed
        // input, so the server doesn't fall farther behind the client than
        // it must.
        let scan = (self.ghost_input_count as usize).min(self.frames_input.len());
        let ghost_packet_id = next_input_id + self.ghost_input_count;

        let mut recovered: Option<FrameInput> = None;

        let mut consumed = DataBuffer::from_bit_array(inputs_buffer.buffer().clone());
        consumed.shrink_to(INPUT_METADATA_BITS as u32, inputs_buffer.size());

        for _ in 0..scan {
            let head_id = self.frames_input.front().map(|f| f.id).expect("non-empty");
            if ghost_packet_id < head_id {
                break;
            }
            let frame = self.take_front();

            let mut candidate = DataBuffer::from_bit_array(frame.payload.clone());
            candidate.shrink_to(
                INPUT_METADATA_BITS as u32,
                frame.payload_bit_size.saturating_sub(INPUT_METADATA_BITS) as u32,
            );
            consumed.begin_read();
            consumed.seek(INPUT_METADATA_BITS as u32);
            candidate.begin_read();
            candidate.seek(INPUT_METADATA_BITS as u32);
            let are_different = host.are_inputs_different(authority, &mut consumed, &mut candidate);

            recovered = Some(frame);
            if are_different {
                // This input carries changes; execute from here.
                break;
            }
        }

        match recovered {
            Some(frame) => {
                trace!(authority, recovered = %frame.id, "input recovered after a gap");
                self.ghost_input_count = 0;
                self.set_frame_input(inputs_buffer, &frame, false)
            }
            None => {
                self.ghost_input_count += 1;
                FetchResult::default()
            }
        }
    }

    /// Runs the app process hook with the selected inputs buffer.
    pub fn process_consumed_input(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        host: &mut dyn SceneHost,
    ) {
        if self.current_input_buffer_id.is_none() {
            // Skip everything until the first input arrives.
            return;
        }
        inputs_buffer.begin_read();
        inputs_buffer.seek(INPUT_METADATA_BITS as u32);
        host.process(authority, delta, inputs_buffer);
    }
}
