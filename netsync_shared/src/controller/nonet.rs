//! Offline controller: keeps the collect/process workflow identical when no
//! network is involved.

use super::ControllerCtx;
use crate::data_buffer::DataBuffer;
use crate::frame::FrameIndex;
use crate::net::PeerId;

#[derive(Debug)]
pub struct NoNetController {
    frame_id: FrameIndex,
}

impl Default for NoNetController {
    fn default() -> Self {
        Self {
            frame_id: FrameIndex(0),
        }
    }
}

impl NoNetController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_frame_index(&self) -> FrameIndex {
        self.frame_id
    }

    pub fn process(
        &mut self,
        authority: PeerId,
        inputs_buffer: &mut DataBuffer,
        delta: f32,
        ctx: &mut ControllerCtx,
    ) {
        // No metadata needed offline: collect and consume right away.
        inputs_buffer.begin_write(0);
        ctx.host.collect_input(authority, delta, inputs_buffer);
        inputs_buffer.dry();
        inputs_buffer.begin_read();
        ctx.host.process(authority, delta, inputs_buffer);
        self.frame_id += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::controller::tests::ByteInputHost;
    use crate::object::ObjectRegistry;

    #[test]
    fn frame_counter_is_monotone() {
        let config = SyncConfig::default();
        let mut registry = ObjectRegistry::new();
        let mut host = ByteInputHost;
        let mut controller = NoNetController::new();
        let mut buffer = DataBuffer::new();

        for expected in 0..3u32 {
            assert_eq!(controller.current_frame_index(), FrameIndex(expected));
            let mut ctx = ControllerCtx {
                config: &config,
                host: &mut host,
                registry: &mut registry,
            };
            controller.process(0, &mut buffer, 1.0 / 60.0, &mut ctx);
        }
    }
}
