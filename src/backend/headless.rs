// Headless backend - no GPU, records what would have been drawn
//
// Used with the simulated runtime when graphics.backend = "headless" and as
// the drawing fake in tests. Failures can be injected per target.

use std::collections::{HashSet, VecDeque};

use super::{GraphicsBackend, RenderError};
use crate::runtime::{Extent2D, TargetHandle};

/// Draws remembered for inspection; older ones are only counted.
const DRAW_HISTORY: usize = 256;

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    extent: Option<Extent2D>,
    rendered: VecDeque<TargetHandle>,
    draws: u64,
    incomplete: HashSet<TargetHandle>,
    device_failure: Option<TargetHandle>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `target` as an incomplete framebuffer whenever it is drawn.
    pub fn mark_incomplete(&mut self, target: TargetHandle) {
        self.incomplete.insert(target);
    }

    /// Fail with a device error when `target` is drawn.
    pub fn fail_device_on(&mut self, target: TargetHandle) {
        self.device_failure = Some(target);
    }

    /// Most recent targets drawn, in draw order.
    pub fn rendered(&self) -> Vec<TargetHandle> {
        self.rendered.iter().copied().collect()
    }

    /// Every successful draw since creation.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn extent(&self) -> Option<Extent2D> {
        self.extent
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn initialize_device(&mut self, width: u32, height: u32) -> Result<(), RenderError> {
        log::info!("Headless graphics device: {}x{}", width, height);
        self.extent = Some(Extent2D::new(width, height));
        Ok(())
    }

    fn render_to_target(&mut self, target: TargetHandle, extent: Extent2D) -> Result<(), RenderError> {
        if self.extent.is_none() {
            return Err(RenderError::Uninitialized);
        }
        if self.device_failure == Some(target) {
            return Err(RenderError::device("render_to_target", "injected device loss"));
        }
        if self.incomplete.contains(&target) {
            return Err(RenderError::TargetIncomplete(target));
        }

        log::trace!("Render to target {:?} ({}x{})", target, extent.width, extent.height);
        if self.rendered.len() == DRAW_HISTORY {
            self.rendered.pop_front();
        }
        self.rendered.push_back(target);
        self.draws += 1;
        Ok(())
    }
}
