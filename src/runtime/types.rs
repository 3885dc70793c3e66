// Plain data exchanged with the XR runtime
//
// These mirror the runtime's own structures closely enough that a binding can
// convert field-for-field, while staying free of any loader or FFI types.

use glam::{Quat, Vec3};
use std::time::Duration;

/// Runtime clock value in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(pub i64);

impl Time {
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

/// Primary view configuration, fixed when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewConfigurationType {
    PrimaryMono,
    PrimaryStereo,
}

impl ViewConfigurationType {
    /// Number of views this configuration is defined to have.
    pub fn view_count(self) -> usize {
        match self {
            ViewConfigurationType::PrimaryMono => 1,
            ViewConfigurationType::PrimaryStereo => 2,
        }
    }
}

/// Per-view sizing hints reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewConfigurationView {
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub recommended_sample_count: u32,
    pub max_sample_count: u32,
}

/// Ordered per-view descriptors, queried once at startup and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewConfiguration {
    kind: ViewConfigurationType,
    views: Vec<ViewConfigurationView>,
}

impl ViewConfiguration {
    pub fn new(kind: ViewConfigurationType, views: Vec<ViewConfigurationView>) -> Self {
        Self { kind, views }
    }

    pub fn kind(&self) -> ViewConfigurationType {
        self.kind
    }

    pub fn views(&self) -> &[ViewConfigurationView] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSpaceType {
    View,
    Local,
    Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Field of view as four half-angles in radians (left and down are negative).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    pub fn symmetric(half_angle: f32) -> Self {
        Self {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }
}

/// One eye's viewpoint for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

/// Validity/tracking bits returned alongside located views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewStateFlags(pub u64);

impl ViewStateFlags {
    pub const EMPTY: Self = Self(0);
    pub const ORIENTATION_VALID: Self = Self(0x1);
    pub const POSITION_VALID: Self = Self(0x2);
    pub const ORIENTATION_TRACKED: Self = Self(0x4);
    pub const POSITION_TRACKED: Self = Self(0x8);
    pub const ALL: Self = Self(0xF);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Both position and orientation are usable for rendering.
    pub fn pose_valid(self) -> bool {
        self.contains(Self::POSITION_VALID) && self.contains(Self::ORIENTATION_VALID)
    }
}

impl std::ops::BitOr for ViewStateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Result of waiting for the next frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    pub predicted_display_time: Time,
    pub predicted_display_period: Duration,
    /// Runtime hint only; render authorization comes from the session state.
    pub should_render: bool,
}

/// Opaque render target handle handed out by a runtime swapchain
/// (a texture name or a raw image handle, depending on the graphics API).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u64);

/// Identity of a runtime swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SwapchainId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub extent: Extent2D,
}

impl Rect2D {
    pub fn from_extent(extent: Extent2D) -> Self {
        Self { x: 0, y: 0, extent }
    }
}

/// Parameters for one per-view swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub format: i64,
    pub extent: Extent2D,
    pub sample_count: u32,
}

/// Region of a swapchain image that holds one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubImage {
    pub swapchain: SwapchainId,
    pub image_index: u32,
    pub rect: Rect2D,
    pub array_index: u32,
}

/// One (pose, fov, sub-image) entry of a projection layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub pose: Pose,
    pub fov: Fov,
    pub sub_image: SubImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionLayer {
    pub space: ReferenceSpaceType,
    pub blend_texture_source_alpha: bool,
    pub views: Vec<ProjectionView>,
}

/// Everything handed to the end-of-frame call, built fresh each frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionSubmission {
    pub display_time: Time,
    pub blend_mode: BlendMode,
    pub layers: Vec<ProjectionLayer>,
}

impl CompositionSubmission {
    pub fn empty(display_time: Time, blend_mode: BlendMode) -> Self {
        Self {
            display_time,
            blend_mode,
            layers: Vec::new(),
        }
    }

    /// Total number of view tuples across all layers.
    pub fn view_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.views.len()).sum()
    }

    /// First layer space for which `available` returns false.
    pub fn missing_space(&self, available: impl Fn(ReferenceSpaceType) -> bool) -> Option<ReferenceSpaceType> {
        self.layers.iter().map(|layer| layer.space).find(|space| !available(*space))
    }
}

/// Outcome of waiting for an acquired image to become writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageWait {
    Ready,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_valid_needs_both_bits() {
        assert!(ViewStateFlags::ALL.pose_valid());
        assert!((ViewStateFlags::POSITION_VALID | ViewStateFlags::ORIENTATION_VALID).pose_valid());
        assert!(!ViewStateFlags::POSITION_VALID.pose_valid());
        assert!(!(ViewStateFlags::ORIENTATION_VALID | ViewStateFlags::ORIENTATION_TRACKED).pose_valid());
        assert!(!ViewStateFlags::EMPTY.pose_valid());
    }

    #[test]
    fn submission_counts_views_across_layers() {
        let submission = CompositionSubmission::empty(Time(5), BlendMode::Opaque);
        assert_eq!(submission.view_count(), 0);
    }

    #[test]
    fn missing_space_names_first_unavailable_layer() {
        let layer = |space| ProjectionLayer {
            space,
            blend_texture_source_alpha: true,
            views: Vec::new(),
        };
        let mut submission = CompositionSubmission::empty(Time(5), BlendMode::Opaque);
        assert_eq!(submission.missing_space(|_| false), None);

        submission.layers = vec![layer(ReferenceSpaceType::Local), layer(ReferenceSpaceType::Stage)];
        assert_eq!(submission.missing_space(|space| space == ReferenceSpaceType::Local), Some(ReferenceSpaceType::Stage));
        assert_eq!(submission.missing_space(|_| true), None);
    }
}
