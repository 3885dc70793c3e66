// =============================================================================
// FRAME COORDINATOR - one iteration of the render loop
// =============================================================================
//
// wait -> begin -> (sync input) -> locate views -> per view:
// acquire / wait / draw / release -> end
//
// Rules held for every frame:
// - a begun frame is always ended, with zero layers if anything in between
//   failed
// - every acquired image is released, even when drawing failed
// - the submission carries either every configured view or none of them

use std::time::{Duration, Instant};

use super::swapchain_pool::SwapchainPool;
use super::timing::{FramePhases, FrameTiming};
use crate::backend::{GraphicsBackend, RenderError};
use crate::error::{XrError, XrResult};
use crate::runtime::{
    BlendMode, CompositionSubmission, FrameState, ImageWait, ProjectionLayer, ProjectionView, Rect2D,
    ReferenceSpaceType, Runtime, RuntimeSwapchain, SessionState, SubImage, ViewConfiguration,
};

#[derive(Debug, Clone)]
pub struct FrameSettings {
    pub space: ReferenceSpaceType,
    pub blend_mode: BlendMode,
    pub image_wait_timeout: Duration,
    pub honor_should_render: bool,
    /// Log timing statistics every N frames (0 = only at shutdown).
    pub stats_interval: u64,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            space: ReferenceSpaceType::Stage,
            blend_mode: BlendMode::Opaque,
            image_wait_timeout: Duration::ZERO,
            honor_should_render: false,
            stats_interval: 0,
        }
    }
}

/// Why a frame went out with no layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotVisible,
    ShouldRenderFalse,
    PoseInvalid,
    ViewsDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub layers: usize,
    pub views: usize,
    pub skipped: Option<SkipReason>,
}

struct Composition {
    submission: CompositionSubmission,
    skipped: Option<SkipReason>,
}

pub struct FrameCoordinator<S: RuntimeSwapchain, B: GraphicsBackend> {
    view_configuration: ViewConfiguration,
    pools: Vec<SwapchainPool<S>>,
    backend: B,
    settings: FrameSettings,
    timing: FrameTiming,
    frame_index: u64,
}

impl<S: RuntimeSwapchain, B: GraphicsBackend> FrameCoordinator<S, B> {
    /// Checks that there is exactly one pool per configured view, in view
    /// order. Nothing is acquired before this passes.
    pub fn new(
        view_configuration: ViewConfiguration,
        pools: Vec<SwapchainPool<S>>,
        backend: B,
        settings: FrameSettings,
    ) -> XrResult<Self> {
        let expected = view_configuration.kind().view_count();
        if view_configuration.len() != expected {
            return Err(XrError::Consistency(format!(
                "{:?} defines {} views but the runtime reported {}",
                view_configuration.kind(),
                expected,
                view_configuration.len()
            )));
        }
        if pools.len() != view_configuration.len() {
            return Err(XrError::Consistency(format!(
                "{} views configured but {} swapchains present",
                view_configuration.len(),
                pools.len()
            )));
        }
        if let Some((position, pool)) = pools
            .iter()
            .enumerate()
            .find(|(position, pool)| pool.view_index() != *position)
        {
            return Err(XrError::Consistency(format!(
                "swapchain for view {} sits at position {}",
                pool.view_index(),
                position
            )));
        }

        Ok(Self {
            view_configuration,
            pools,
            backend,
            settings,
            timing: FrameTiming::default(),
            frame_index: 0,
        })
    }

    pub fn view_count(&self) -> usize {
        self.view_configuration.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn timing(&self) -> &FrameTiming {
        &self.timing
    }

    /// Run exactly one frame against `runtime` in session state `state`.
    pub fn run_frame<R>(&mut self, runtime: &mut R, state: SessionState) -> XrResult<FrameReport>
    where
        R: Runtime<Swapchain = S>,
    {
        // STEP 1: Wait for the frame slot
        let start = Instant::now();
        let frame = runtime.wait_frame()?;
        let wait = start.elapsed();
        self.timing.set_budget(frame.predicted_display_period);

        // STEP 2: Begin. From here on the frame must be ended.
        runtime.begin_frame()?;

        // STEP 3: Build the submission
        let render_start = Instant::now();
        let composed = self.compose(runtime, state, &frame);
        let render = render_start.elapsed();

        let (submission, composed) = match composed {
            Ok(composition) => (composition.submission, Ok(composition.skipped)),
            Err(err) => {
                log::error!("Frame {} aborted: {}. Ending it with no layers", self.frame_index, err);
                (
                    CompositionSubmission::empty(frame.predicted_display_time, self.settings.blend_mode),
                    Err(err),
                )
            }
        };

        // STEP 4: End, exactly once
        let submit_start = Instant::now();
        let ended = runtime.end_frame(&submission);
        let submit = submit_start.elapsed();

        self.timing.record(FramePhases { wait, render, submit });
        self.frame_index += 1;
        if self.settings.stats_interval > 0 && self.frame_index % self.settings.stats_interval == 0 {
            self.timing.log_summary();
        }

        let skipped = match (composed, ended) {
            (Err(err), Err(end_err)) => {
                log::error!("Ending the aborted frame also failed: {}", end_err);
                return Err(err);
            }
            (Err(err), Ok(_)) => return Err(err),
            (Ok(_), Err(end_err)) => return Err(end_err),
            (Ok(skipped), Ok(_)) => skipped,
        };

        log::trace!(
            "Frame {} ended: {} layer(s), {} view(s)",
            self.frame_index,
            submission.layers.len(),
            submission.view_count()
        );

        Ok(FrameReport {
            layers: submission.layers.len(),
            views: submission.view_count(),
            skipped,
        })
    }

    fn compose<R>(&mut self, runtime: &mut R, state: SessionState, frame: &FrameState) -> XrResult<Composition>
    where
        R: Runtime<Swapchain = S>,
    {
        let display_time = frame.predicted_display_time;
        let blend_mode = self.settings.blend_mode;
        let nothing = |reason| {
            Ok(Composition {
                submission: CompositionSubmission::empty(display_time, blend_mode),
                skipped: Some(reason),
            })
        };

        if state.accepts_input() {
            runtime.sync_actions()?;
        }

        if !state.renders() {
            return nothing(SkipReason::NotVisible);
        }
        if self.settings.honor_should_render && !frame.should_render {
            log::debug!("Runtime hint: should_render = false, skipping draw");
            return nothing(SkipReason::ShouldRenderFalse);
        }

        let (view_state, views) = runtime.locate_views(display_time, self.settings.space)?;
        if !view_state.pose_valid() {
            log::debug!("View pose not valid (flags {:#x}), submitting no layers", view_state.0);
            return nothing(SkipReason::PoseInvalid);
        }
        if views.len() != self.pools.len() {
            return Err(XrError::Consistency(format!(
                "runtime located {} views for {} swapchains",
                views.len(),
                self.pools.len()
            )));
        }

        let timeout = self.settings.image_wait_timeout;
        let mut projection_views = Vec::with_capacity(views.len());
        for (pool, view) in self.pools.iter_mut().zip(&views) {
            if let Some(image_index) = render_view(pool, &mut self.backend, timeout)? {
                projection_views.push(ProjectionView {
                    pose: view.pose,
                    fov: view.fov,
                    sub_image: SubImage {
                        swapchain: pool.id(),
                        image_index,
                        rect: Rect2D::from_extent(pool.extent()),
                        array_index: 0,
                    },
                });
            }
        }

        if projection_views.len() != self.pools.len() {
            log::warn!(
                "Only {} of {} views rendered, submitting no layers",
                projection_views.len(),
                self.pools.len()
            );
            return nothing(SkipReason::ViewsDropped);
        }

        Ok(Composition {
            submission: CompositionSubmission {
                display_time,
                blend_mode,
                layers: vec![ProjectionLayer {
                    space: self.settings.space,
                    blend_texture_source_alpha: true,
                    views: projection_views,
                }],
            },
            skipped: None,
        })
    }
}

/// Acquire, wait, draw and release one view. Returns the image index when
/// the view was drawn, `None` when its contribution has to be dropped.
fn render_view<S, B>(pool: &mut SwapchainPool<S>, backend: &mut B, timeout: Duration) -> XrResult<Option<u32>>
where
    S: RuntimeSwapchain,
    B: GraphicsBackend,
{
    let index = pool.acquire()?;
    let drawn = draw_acquired(pool, backend, timeout);
    let released = pool.release();

    match (drawn, released) {
        (Err(err), Err(release_err)) => {
            log::error!("Release after failed draw on view {} also failed: {}", pool.view_index(), release_err);
            Err(err)
        }
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        (Ok(drawn), Ok(_)) => Ok(drawn.then_some(index)),
    }
}

fn draw_acquired<S, B>(pool: &mut SwapchainPool<S>, backend: &mut B, timeout: Duration) -> XrResult<bool>
where
    S: RuntimeSwapchain,
    B: GraphicsBackend,
{
    if pool.wait(timeout)? == ImageWait::TimedOut {
        log::warn!(
            "View {} image not ready within {:?}, dropping view",
            pool.view_index(),
            timeout
        );
        return Ok(false);
    }

    let target = pool.writable_target()?;
    match backend.render_to_target(target, pool.extent()) {
        Ok(()) => Ok(true),
        Err(RenderError::TargetIncomplete(target)) => {
            log::warn!("View {} target {:?} incomplete, dropping view", pool.view_index(), target);
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{format, HeadlessBackend};
    use crate::config::SimulationConfig;
    use crate::error::StatusCode;
    use crate::runtime::simulated::{Call, Op, SimulatedRuntime, SimulatedSwapchain, SimulationHandle};
    use crate::runtime::{
        Extent2D, SwapchainCreateInfo, SwapchainId, TargetHandle, ViewConfigurationType, ViewStateFlags,
    };

    type Coordinator = FrameCoordinator<SimulatedSwapchain, HeadlessBackend>;

    struct Harness {
        runtime: SimulatedRuntime,
        handle: SimulationHandle,
        coordinator: Coordinator,
    }

    fn pools(runtime: &mut SimulatedRuntime, count: usize) -> Vec<SwapchainPool<SimulatedSwapchain>> {
        let extent = Extent2D::new(1440, 1600);
        (0..count)
            .map(|view| {
                let swapchain = runtime
                    .create_swapchain(&SwapchainCreateInfo {
                        format: format::A2B10G10R10_UNORM.code,
                        extent,
                        sample_count: 1,
                    })
                    .unwrap();
                SwapchainPool::new(view, swapchain, format::A2B10G10R10_UNORM, extent).unwrap()
            })
            .collect()
    }

    /// Two-view runtime with a running, visible session and no autopilot.
    fn harness_with(config: SimulationConfig, settings: FrameSettings) -> Harness {
        let mut runtime = SimulatedRuntime::new(config);
        let handle = runtime.handle();
        handle.set_autopilot(false);
        handle.push_state(SessionState::Ready);
        runtime.begin_session(ViewConfigurationType::PrimaryStereo).unwrap();
        handle.push_state(SessionState::Synchronized);
        handle.push_state(SessionState::Visible);

        let view_configuration = runtime.view_configuration(ViewConfigurationType::PrimaryStereo).unwrap();
        let pools = pools(&mut runtime, 2);
        let mut backend = HeadlessBackend::new();
        backend.initialize_device(1440, 1600).unwrap();
        let coordinator = FrameCoordinator::new(view_configuration, pools, backend, settings).unwrap();

        handle.clear_journal();
        Harness {
            runtime,
            handle,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(SimulationConfig::default(), FrameSettings::default())
    }

    impl Harness {
        fn frame(&mut self, state: SessionState) -> XrResult<FrameReport> {
            self.coordinator.run_frame(&mut self.runtime, state)
        }

        fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
            self.handle.count(predicate)
        }

        fn begins_and_ends(&self) -> (usize, usize) {
            (
                self.count(|c| *c == Call::BeginFrame),
                self.count(|c| matches!(c, Call::EndFrame { .. })),
            )
        }
    }

    #[test]
    fn two_views_render_in_swapchain_order() {
        let mut h = harness();
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report, FrameReport { layers: 1, views: 2, skipped: None });

        let journal: Vec<Call> = h
            .handle
            .journal()
            .into_iter()
            .filter(|c| matches!(c, Call::AcquireImage(_) | Call::WaitImage(_) | Call::ReleaseImage(_)))
            .collect();
        assert_eq!(
            journal,
            vec![
                Call::AcquireImage(SwapchainId(0)),
                Call::WaitImage(SwapchainId(0)),
                Call::ReleaseImage(SwapchainId(0)),
                Call::AcquireImage(SwapchainId(1)),
                Call::WaitImage(SwapchainId(1)),
                Call::ReleaseImage(SwapchainId(1)),
            ]
        );

        let submission = h.handle.last_submission().unwrap();
        let layer = &submission.layers[0];
        assert_eq!(layer.space, ReferenceSpaceType::Stage);
        assert!(layer.blend_texture_source_alpha);
        let swapchains: Vec<SwapchainId> = layer.views.iter().map(|v| v.sub_image.swapchain).collect();
        assert_eq!(swapchains, vec![SwapchainId(0), SwapchainId(1)]);
        assert_eq!(layer.views[0].sub_image.rect.extent, Extent2D::new(1440, 1600));
        assert!(layer.views[0].pose.position.x < layer.views[1].pose.position.x);

        // first image of each ring: handles 1 and 4
        assert_eq!(h.coordinator.backend().rendered(), vec![TargetHandle(1), TargetHandle(4)]);
    }

    #[test]
    fn invalid_orientation_submits_nothing_and_acquires_nothing() {
        let mut h = harness();
        h.handle.set_view_state(ViewStateFlags::POSITION_VALID | ViewStateFlags::POSITION_TRACKED);

        let report = h.frame(SessionState::Focused).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::PoseInvalid));
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 0);
        assert_eq!(h.handle.last_submission().unwrap().layers.len(), 0);
        assert_eq!(h.begins_and_ends(), (1, 1));
    }

    #[test]
    fn invalid_position_also_skips() {
        let mut h = harness();
        h.handle.set_view_state(ViewStateFlags::ORIENTATION_VALID);
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.layers, 0);
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 0);
    }

    #[test]
    fn not_visible_ends_frame_without_rendering() {
        let mut h = harness();
        for state in [SessionState::Ready, SessionState::Synchronized] {
            let report = h.frame(state).unwrap();
            assert_eq!(report.skipped, Some(SkipReason::NotVisible));
        }
        assert_eq!(h.count(|c| *c == Call::LocateViews), 0);
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 0);
        assert_eq!(h.begins_and_ends(), (2, 2));
    }

    #[test]
    fn input_synced_only_when_focused() {
        let mut h = harness();
        h.frame(SessionState::Visible).unwrap();
        assert_eq!(h.count(|c| *c == Call::SyncActions), 0);
        h.frame(SessionState::Focused).unwrap();
        assert_eq!(h.count(|c| *c == Call::SyncActions), 1);
    }

    #[test]
    fn should_render_hint_is_advisory_by_default() {
        let config = SimulationConfig {
            should_render: false,
            ..SimulationConfig::default()
        };
        let mut h = harness_with(config, FrameSettings::default());
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.views, 2);
    }

    #[test]
    fn should_render_hint_skips_when_honored() {
        let config = SimulationConfig {
            should_render: false,
            ..SimulationConfig::default()
        };
        let settings = FrameSettings {
            honor_should_render: true,
            ..FrameSettings::default()
        };
        let mut h = harness_with(config, settings);
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::ShouldRenderFalse));
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 0);
        assert_eq!(h.begins_and_ends(), (1, 1));
    }

    #[test]
    fn located_view_count_mismatch_is_fatal_but_frame_is_ended() {
        let mut h = harness();
        h.handle.set_located_view_count(Some(1));

        let err = h.frame(SessionState::Visible).unwrap_err();
        assert!(matches!(err, XrError::Consistency(_)));
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 0);
        assert_eq!(h.begins_and_ends(), (1, 1));
        assert_eq!(h.handle.last_submission().unwrap().layers.len(), 0);
    }

    #[test]
    fn incomplete_target_drops_layer_but_releases() {
        let mut h = harness();
        // second view's first image
        h.coordinator.backend_mut().mark_incomplete(TargetHandle(4));

        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::ViewsDropped));
        assert_eq!(report.views, 0);
        assert_eq!(h.count(|c| matches!(c, Call::AcquireImage(_))), 2);
        assert_eq!(h.count(|c| matches!(c, Call::ReleaseImage(_))), 2);
        assert_eq!(h.handle.outstanding_images(), 0);

        // next frame moves on to the next images and renders fully
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.views, 2);
    }

    #[test]
    fn image_wait_timeout_is_reported_and_released() {
        let mut h = harness();
        h.handle.time_out_image_waits(1);

        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.skipped, Some(SkipReason::ViewsDropped));
        assert_eq!(h.count(|c| matches!(c, Call::ReleaseImage(_))), 2);
        assert_eq!(h.coordinator.backend().rendered().len(), 1);
    }

    #[test]
    fn device_error_is_fatal_after_release() {
        let mut h = harness();
        h.coordinator.backend_mut().fail_device_on(TargetHandle(1));

        let err = h.frame(SessionState::Visible).unwrap_err();
        assert!(matches!(err, XrError::Graphics(RenderError::Device { .. })));
        assert_eq!(h.count(|c| matches!(c, Call::ReleaseImage(_))), 1);
        assert_eq!(h.handle.outstanding_images(), 0);
        assert_eq!(h.begins_and_ends(), (1, 1));
    }

    #[test]
    fn runtime_failure_mid_frame_still_ends_frame() {
        let mut h = harness();
        h.handle.script(Op::LocateViews, StatusCode::ERROR_TIME_INVALID);
        let err = h.frame(SessionState::Visible).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_TIME_INVALID));
        assert_eq!(h.begins_and_ends(), (1, 1));

        h.handle.script(Op::WaitImage, StatusCode::ERROR_RUNTIME_FAILURE);
        let err = h.frame(SessionState::Visible).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_RUNTIME_FAILURE));
        assert_eq!(h.begins_and_ends(), (2, 2));
    }

    #[test]
    fn advisory_results_do_not_stop_the_frame() {
        let mut h = harness();
        h.handle.script(Op::BeginFrame, StatusCode::FRAME_DISCARDED);
        h.handle.script(Op::EndFrame, StatusCode::SESSION_LOSS_PENDING);
        let report = h.frame(SessionState::Visible).unwrap();
        assert_eq!(report.views, 2);
    }

    #[test]
    fn view_counts_are_all_or_nothing_over_many_frames() {
        let mut h = harness();
        let flags = [ViewStateFlags::ALL, ViewStateFlags::EMPTY, ViewStateFlags::ORIENTATION_VALID];
        for frame in 0..12 {
            h.handle.set_view_state(flags[frame % flags.len()]);
            if frame % 4 == 1 {
                h.handle.time_out_image_waits(1);
            }
            let state = if frame % 5 == 0 { SessionState::Synchronized } else { SessionState::Focused };
            let report = h.frame(state).unwrap();
            assert!(report.views == 0 || report.views == 2, "frame {} had {} views", frame, report.views);
        }
        let (begins, ends) = h.begins_and_ends();
        assert_eq!(begins, ends);
        assert_eq!(h.handle.outstanding_images(), 0);
        assert_eq!(h.coordinator.timing().frames(), 12);
    }

    #[test]
    fn swapchain_count_mismatch_rejected_before_any_acquire() {
        let mut runtime = SimulatedRuntime::new(SimulationConfig::default());
        let handle = runtime.handle();
        let view_configuration = runtime.view_configuration(ViewConfigurationType::PrimaryStereo).unwrap();
        let one_pool = pools(&mut runtime, 1);

        let err = FrameCoordinator::new(view_configuration, one_pool, HeadlessBackend::new(), FrameSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, XrError::Consistency(_)));
        assert_eq!(handle.count(|c| matches!(c, Call::AcquireImage(_))), 0);
    }

    #[test]
    fn pools_out_of_view_order_are_rejected() {
        let mut runtime = SimulatedRuntime::new(SimulationConfig::default());
        let view_configuration = runtime.view_configuration(ViewConfigurationType::PrimaryStereo).unwrap();
        let mut swapped = pools(&mut runtime, 2);
        swapped.reverse();

        let result = FrameCoordinator::new(view_configuration, swapped, HeadlessBackend::new(), FrameSettings::default());
        assert!(matches!(result, Err(XrError::Consistency(_))));
    }
}
