// Session module - lifecycle and frame protocol
//
// - state: runtime-driven lifecycle, owns begin/end session
// - swapchain_pool: one view's acquire/wait/release ring
// - frame: one loop iteration from wait to end
// - timing: rolling frame statistics

pub mod frame;
pub mod state;
pub mod swapchain_pool;
pub mod timing;

pub use frame::{FrameCoordinator, FrameReport, FrameSettings, SkipReason};
pub use state::{Dispatch, SessionStateMachine};
pub use swapchain_pool::SwapchainPool;
pub use timing::FrameTiming;
