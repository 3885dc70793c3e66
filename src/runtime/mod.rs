// Runtime module - the XR runtime as seen by the session core
//
// Two seams: `Runtime` (instance/session calls) and `RuntimeSwapchain`
// (one runtime-owned ring of render targets). Implementations:
// - simulated: deterministic in-process runtime (default)
// - openxr: real loader-backed runtime (feature "openxr")

pub mod simulated;
pub mod types;

#[cfg(feature = "openxr")]
pub mod openxr;

pub use types::*;

use std::time::Duration;

use crate::error::{Completion, XrResult};

/// Session lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Visible => "visible",
            Self::Focused => "focused",
            Self::Stopping => "stopping",
            Self::LossPending => "loss-pending",
            Self::Exiting => "exiting",
        }
    }

    /// Frames may carry rendered layers.
    pub fn renders(self) -> bool {
        matches!(self, Self::Visible | Self::Focused)
    }

    /// Input actions may be synchronized.
    pub fn accepts_input(self) -> bool {
        self == Self::Focused
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exiting | Self::LossPending)
    }
}

/// A runtime notification, delivered one at a time by `poll_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SessionStateChanged {
        state: SessionState,
        time: Time,
    },
    InstanceLossPending {
        loss_time: Time,
    },
    EventsLost {
        lost_event_count: u32,
    },
    InteractionProfileChanged,
    ReferenceSpaceChangePending {
        space: ReferenceSpaceType,
    },
    DisplayRefreshRateChanged {
        from_hz: f32,
        to_hz: f32,
    },
    VisibilityMaskChanged {
        view_index: u32,
    },
    PerfSettings,
    /// Payload this build does not understand (runtime extension events).
    Unknown {
        type_code: Option<i32>,
    },
}

/// Instance and session calls of the XR runtime.
pub trait Runtime {
    type Swapchain: RuntimeSwapchain;

    /// Next pending event. `Ok(None)` means no event is available, which is normal.
    fn poll_event(&mut self) -> XrResult<Option<Event>>;

    fn begin_session(&mut self, view_configuration: ViewConfigurationType) -> XrResult<Completion>;

    fn end_session(&mut self) -> XrResult<Completion>;

    /// Ask the runtime to walk a running session down to `Stopping`.
    fn request_exit_session(&mut self) -> XrResult<Completion>;

    /// Blocks until the next frame slot (up to one display refresh).
    fn wait_frame(&mut self) -> XrResult<FrameState>;

    fn begin_frame(&mut self) -> XrResult<Completion>;

    fn end_frame(&mut self, submission: &CompositionSubmission) -> XrResult<Completion>;

    fn locate_views(
        &mut self,
        display_time: Time,
        space: ReferenceSpaceType,
    ) -> XrResult<(ViewStateFlags, Vec<View>)>;

    /// Synchronize the single active action set.
    fn sync_actions(&mut self) -> XrResult<Completion>;

    fn view_configuration(&mut self, kind: ViewConfigurationType) -> XrResult<ViewConfiguration>;

    fn environment_blend_modes(&mut self, kind: ViewConfigurationType) -> XrResult<Vec<BlendMode>>;

    fn reference_spaces(&mut self) -> XrResult<Vec<ReferenceSpaceType>>;

    fn swapchain_formats(&mut self) -> XrResult<Vec<i64>>;

    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<Self::Swapchain>;
}

/// One runtime-owned ring of render targets.
pub trait RuntimeSwapchain {
    fn id(&self) -> SwapchainId;

    fn enumerate_images(&mut self) -> XrResult<Vec<TargetHandle>>;

    /// Index into the ring returned by `enumerate_images`.
    fn acquire_image(&mut self) -> XrResult<u32>;

    fn wait_image(&mut self, timeout: Duration) -> XrResult<ImageWait>;

    fn release_image(&mut self) -> XrResult<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_by_state() {
        assert!(!SessionState::Ready.renders());
        assert!(!SessionState::Synchronized.renders());
        assert!(SessionState::Visible.renders());
        assert!(SessionState::Focused.renders());
        assert!(SessionState::Focused.accepts_input());
        assert!(!SessionState::Visible.accepts_input());
        assert!(SessionState::LossPending.is_terminal());
        assert!(SessionState::Exiting.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
    }
}
