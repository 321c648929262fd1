//! Frames in flight.

use crate::error::Result;
use crate::gpu::GpuContext;

/// Ring of frame slots. A slot is reused only after the submission that last
/// used it has completed.
pub struct FrameManager {
    slots: Vec<Option<wgpu::SubmissionIndex>>,
    current: usize,
}

impl FrameManager {
    pub fn new(frame_count: u32) -> Self {
        Self {
            slots: vec![None; frame_count.max(1) as usize],
            current: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    /// Wait for the current slot's previous submission and return the slot.
    pub fn begin_frame(&mut self, ctx: &GpuContext) -> Result<usize> {
        if let Some(submission) = self.slots[self.current].take() {
            ctx.wait_for(submission)?;
        }
        Ok(self.current)
    }

    /// Record the frame's submission and advance to the next slot.
    pub fn end_frame(&mut self, submission: wgpu::SubmissionIndex) {
        self.slots[self.current] = Some(submission);
        self.current = (self.current + 1) % self.slots.len();
    }
}
