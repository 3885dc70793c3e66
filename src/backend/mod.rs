// Backend module - graphics side of the frame loop
//
// The frame coordinator only needs three things from a graphics API:
// bring up a device, pick a swapchain format, and draw into one
// runtime-owned target. Implementations:
// - headless: records draws, no GPU (simulation and tests)
// - vulkan: ash device that clears runtime images on the GPU

pub mod device;
pub mod format;
pub mod headless;
pub mod sync;
pub mod vulkan;

pub use device::VulkanDevice;
pub use format::PixelFormat;
pub use headless::HeadlessBackend;
pub use vulkan::VulkanBackend;

use thiserror::Error;

use crate::error::XrResult;
use crate::runtime::{Extent2D, TargetHandle};

#[derive(Debug, Error)]
pub enum RenderError {
    /// The target cannot be drawn into this frame. Only this view's
    /// contribution is dropped; the frame itself carries on.
    #[error("render target {0:?} is incomplete")]
    TargetIncomplete(TargetHandle),

    #[error("graphics device not initialized")]
    Uninitialized,

    #[error("{operation} failed: {reason}")]
    Device {
        operation: &'static str,
        reason: String,
    },
}

impl RenderError {
    pub fn device(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        RenderError::Device {
            operation,
            reason: reason.to_string(),
        }
    }
}

pub trait GraphicsBackend {
    /// Prepare per-device resources for targets of `width` x `height`.
    fn initialize_device(&mut self, width: u32, height: u32) -> Result<(), RenderError>;

    /// Formats this backend can render into, best first.
    fn format_preference(&self) -> &[PixelFormat] {
        &format::COLOR_FORMAT_PREFERENCE
    }

    /// First preferred format among the runtime's `candidates`.
    fn supported_pixel_format(&self, candidates: &[i64]) -> XrResult<PixelFormat> {
        format::choose_format(candidates, self.format_preference())
    }

    /// Draw one frame's content into `target`.
    fn render_to_target(&mut self, target: TargetHandle, extent: Extent2D) -> Result<(), RenderError>;
}
