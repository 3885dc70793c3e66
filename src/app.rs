// =============================================================================
// APPLICATION - startup sequence and main loop
// =============================================================================
//
// STARTUP:
// 1. Query the view configuration (one descriptor per eye)
// 2. Resolve blend mode and reference space against what the runtime offers
// 3. Pick the swapchain format and bring up the graphics device
// 4. Create one swapchain pool per view, then the frame coordinator
//
// LOOP (one iteration = one step):
// - poll exactly one runtime event and feed it to the state machine
// - if the session loop is active, run exactly one frame
// - a terminal session state or any fatal error ends the loop
//
// =============================================================================

use std::time::Duration;

use crate::backend::GraphicsBackend;
use crate::config::Config;
use crate::error::{XrError, XrResult};
use crate::runtime::{BlendMode, Extent2D, ReferenceSpaceType, Runtime, SessionState, SwapchainCreateInfo};
use crate::session::{FrameCoordinator, FrameSettings, SessionStateMachine, SwapchainPool};

/// Steps allowed for the runtime to walk the session down at shutdown.
const SHUTDOWN_STEPS: usize = 64;

pub struct XrApp<R: Runtime, B: GraphicsBackend> {
    runtime: R,
    machine: SessionStateMachine,
    coordinator: FrameCoordinator<R::Swapchain, B>,
    idle_poll: Duration,
    frames: u64,
    done: bool,
    /// A fatal error ended the loop; the runtime is not called again.
    failed: bool,
    shut_down: bool,
}

impl<R: Runtime, B: GraphicsBackend> XrApp<R, B> {
    pub fn new(mut runtime: R, mut backend: B, config: &Config) -> XrResult<Self> {
        let kind = config.view_configuration();

        // STEP 1: View configuration
        let view_configuration = runtime.view_configuration(kind)?;
        if view_configuration.is_empty() {
            return Err(XrError::Consistency(format!(
                "runtime reported no views for {:?}",
                kind
            )));
        }
        for (i, view) in view_configuration.views().iter().enumerate() {
            log::info!(
                "View {}: recommended {}x{} (max {}x{}), {} sample(s)",
                i,
                view.recommended_width,
                view.recommended_height,
                view.max_width,
                view.max_height,
                view.recommended_sample_count
            );
        }

        // STEP 2: Blend mode and reference space
        let blend_mode = resolve_blend_mode(&runtime.environment_blend_modes(kind)?, config.blend_mode())?;
        let space = resolve_reference_space(&runtime.reference_spaces()?, config.reference_space())?;
        log::info!("Blend mode: {:?}, reference space: {:?}", blend_mode, space);

        // STEP 3: Format and device
        let formats = runtime.swapchain_formats()?;
        let format = backend.supported_pixel_format(&formats)?;
        let first = view_configuration.views()[0];
        backend.initialize_device(first.recommended_width, first.recommended_height)?;

        // STEP 4: One swapchain per view
        let mut pools = Vec::with_capacity(view_configuration.len());
        for (view_index, view) in view_configuration.views().iter().enumerate() {
            let extent = Extent2D::new(view.recommended_width, view.recommended_height);
            let swapchain = runtime.create_swapchain(&SwapchainCreateInfo {
                format: format.code,
                extent,
                sample_count: view.recommended_sample_count,
            })?;
            pools.push(SwapchainPool::new(view_index, swapchain, format, extent)?);
        }

        let settings = FrameSettings {
            space,
            blend_mode,
            image_wait_timeout: config.image_wait_timeout(),
            honor_should_render: config.frame.honor_should_render,
            stats_interval: config.frame.stats_interval_frames,
        };
        let coordinator = FrameCoordinator::new(view_configuration, pools, backend, settings)?;
        log::info!("Frame coordinator ready: {} view(s)", coordinator.view_count());

        Ok(Self {
            runtime,
            machine: SessionStateMachine::new(kind),
            coordinator,
            idle_poll: config.idle_poll_interval(),
            frames: 0,
            done: false,
            failed: false,
            shut_down: false,
        })
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn machine(&self) -> &SessionStateMachine {
        &self.machine
    }

    pub fn coordinator(&self) -> &FrameCoordinator<R::Swapchain, B> {
        &self.coordinator
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Frames run (begun and ended) so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Loop until the session exits or something fatal happens, then shut down.
    pub fn run(&mut self) -> XrResult<()> {
        log::info!("Entering main loop");
        let result = loop {
            if self.done {
                break Ok(());
            }
            if let Err(err) = self.step() {
                break Err(err);
            }
        };
        self.shutdown();
        result
    }

    /// One loop iteration. A fatal error marks the app done and is returned.
    pub fn step(&mut self) -> XrResult<()> {
        if self.done {
            return Ok(());
        }
        self.advance().map_err(|err| {
            log::error!("Fatal: {}", err);
            self.done = true;
            self.failed = true;
            err
        })
    }

    fn advance(&mut self) -> XrResult<()> {
        let polled = match self.runtime.poll_event()? {
            Some(event) => {
                self.machine.handle_event(&mut self.runtime, event)?;
                true
            }
            None => false,
        };

        if self.machine.is_terminal() {
            log::info!("Session {}, leaving main loop", self.machine.state().as_str());
            self.done = true;
            return Ok(());
        }

        if self.machine.frame_loop_active() {
            self.coordinator.run_frame(&mut self.runtime, self.machine.state())?;
            self.frames += 1;
        } else if !polled && !self.idle_poll.is_zero() {
            std::thread::sleep(self.idle_poll);
        }
        Ok(())
    }

    /// End a still-running session and log final statistics. Safe to call
    /// more than once. After a fatal error the session is left as is: no
    /// further event is polled and no frame is run.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.failed {
            log::warn!("Skipping session exit after fatal error");
        } else if self.machine.is_running() && !self.machine.is_terminal() {
            log::info!("Requesting session exit");
            match self.runtime.request_exit_session() {
                Ok(_) => {
                    for _ in 0..SHUTDOWN_STEPS {
                        if !self.machine.is_running() || self.machine.is_terminal() {
                            break;
                        }
                        if let Err(err) = self.advance() {
                            log::error!("Error while shutting down: {}", err);
                            break;
                        }
                    }
                }
                Err(err) => log::error!("Could not request session exit: {}", err),
            }
            if self.machine.is_running() {
                log::warn!("Session still running at shutdown");
            }
        }

        self.done = true;
        self.coordinator.timing().log_summary();
        log::info!("Shut down after {} frames", self.frames);
    }
}

/// Preferred mode if the runtime offers it, else the runtime's first.
pub fn resolve_blend_mode(available: &[BlendMode], preferred: BlendMode) -> XrResult<BlendMode> {
    if available.contains(&preferred) {
        return Ok(preferred);
    }
    let fallback = available.first().copied().ok_or_else(|| {
        XrError::Consistency("runtime reported no environment blend modes".to_string())
    })?;
    log::warn!("Blend mode {:?} not supported, using {:?}", preferred, fallback);
    Ok(fallback)
}

/// Preferred space if available, else local, else whatever comes first.
pub fn resolve_reference_space(
    available: &[ReferenceSpaceType],
    preferred: ReferenceSpaceType,
) -> XrResult<ReferenceSpaceType> {
    if available.contains(&preferred) {
        return Ok(preferred);
    }
    let fallback = if available.contains(&ReferenceSpaceType::Local) {
        ReferenceSpaceType::Local
    } else {
        available.first().copied().ok_or_else(|| {
            XrError::Consistency("runtime reported no reference spaces".to_string())
        })?
    };
    log::warn!("Reference space {:?} not supported, using {:?}", preferred, fallback);
    Ok(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::config::SimulationConfig;
    use crate::error::StatusCode;
    use crate::runtime::simulated::{Call, Op, SimulatedRuntime, SimulationHandle};
    use crate::runtime::{Event, Time};

    type App = XrApp<SimulatedRuntime, HeadlessBackend>;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.runtime.idle_poll_ms = 0;
        config
    }

    fn app_with(simulation: SimulationConfig, config: &Config) -> XrResult<(App, SimulationHandle)> {
        let runtime = SimulatedRuntime::new(simulation);
        let handle = runtime.handle();
        let app = XrApp::new(runtime, HeadlessBackend::new(), config)?;
        Ok((app, handle))
    }

    fn app(exit_after_frames: u64) -> (App, SimulationHandle) {
        let simulation = SimulationConfig {
            exit_after_frames,
            ..SimulationConfig::default()
        };
        app_with(simulation, &test_config()).unwrap()
    }

    fn step_until(app: &mut App, state: SessionState) {
        for _ in 0..100 {
            if app.state() == state {
                return;
            }
            app.step().unwrap();
        }
        panic!("never reached {:?}, stuck in {:?}", state, app.state());
    }

    #[test]
    fn full_lifecycle_runs_to_exit() {
        let (mut app, handle) = app(10);
        app.run().unwrap();

        assert!(app.is_done());
        assert_eq!(app.state(), SessionState::Exiting);
        assert_eq!(handle.count(|c| *c == Call::BeginSession), 1);
        assert_eq!(handle.count(|c| *c == Call::EndSession), 1);
        assert_eq!(
            handle.count(|c| *c == Call::BeginFrame),
            handle.count(|c| matches!(c, Call::EndFrame { .. }))
        );
        assert_eq!(handle.outstanding_images(), 0);
        assert!(handle.frames_ended() >= 10);

        let partial = handle.count(|c| matches!(c, Call::EndFrame { views, .. } if *views != 0 && *views != 2));
        assert_eq!(partial, 0);
        let rendered = handle.count(|c| matches!(c, Call::EndFrame { views: 2, .. }));
        assert!(rendered > 0);
        assert_eq!(app.coordinator().backend().extent(), Some(Extent2D::new(1440, 1600)));
    }

    #[test]
    fn no_frames_after_terminal_state() {
        let (mut app, handle) = app(0);
        step_until(&mut app, SessionState::Focused);

        handle.push_event(Event::InstanceLossPending { loss_time: Time(0) });
        // drain queued events until the loss notification is handled
        while !app.is_done() {
            app.step().unwrap();
        }
        assert_eq!(app.state(), SessionState::LossPending);

        let waits = handle.count(|c| *c == Call::WaitFrame);
        app.step().unwrap();
        assert_eq!(handle.count(|c| *c == Call::WaitFrame), waits);
    }

    #[test]
    fn poll_failure_is_fatal() {
        let (mut app, handle) = app(0);
        handle.script(Op::PollEvent, StatusCode::ERROR_INSTANCE_LOST);
        let err = app.run().unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_INSTANCE_LOST));
        assert!(app.is_done());
    }

    #[test]
    fn fatal_error_makes_no_further_runtime_calls() {
        let (mut app, handle) = app(0);
        step_until(&mut app, SessionState::Focused);

        handle.clear_journal();
        handle.script(Op::PollEvent, StatusCode::ERROR_INSTANCE_LOST);
        let err = app.run().unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_INSTANCE_LOST));

        // The failed poll is the only call after the fault.
        assert_eq!(handle.journal(), vec![Call::PollEvent]);
        assert_eq!(handle.count(|c| *c == Call::WaitFrame), 0);
        assert_eq!(handle.count(|c| *c == Call::RequestExitSession), 0);
        assert!(handle.is_running());

        app.shutdown();
        assert_eq!(handle.journal().len(), 1);
    }

    #[test]
    fn fatal_frame_error_stops_loop_with_frame_ended() {
        let (mut app, handle) = app(0);
        step_until(&mut app, SessionState::Visible);

        handle.set_located_view_count(Some(3));
        let err = app.run().unwrap_err();
        assert!(matches!(err, XrError::Consistency(_)));
        assert_eq!(
            handle.count(|c| *c == Call::BeginFrame),
            handle.count(|c| matches!(c, Call::EndFrame { .. }))
        );
    }

    #[test]
    fn duplicate_ready_begins_once() {
        let (mut app, handle) = app(0);
        app.step().unwrap(); // idle (duplicate of the initial state)
        app.step().unwrap(); // ready -> begin
        handle.push_event(Event::SessionStateChanged {
            state: SessionState::Ready,
            time: Time(0),
        });
        for _ in 0..4 {
            app.step().unwrap();
        }
        assert_eq!(handle.count(|c| *c == Call::BeginSession), 1);
    }

    #[test]
    fn shutdown_ends_running_session() {
        let (mut app, handle) = app(0);
        step_until(&mut app, SessionState::Focused);
        assert!(handle.is_running());

        app.shutdown();
        assert!(!handle.is_running());
        assert!(!app.machine().is_running());
        assert_eq!(handle.count(|c| *c == Call::EndSession), 1);
        assert!(app.is_done());

        app.shutdown();
        assert_eq!(handle.count(|c| *c == Call::EndSession), 1);
    }

    #[test]
    fn empty_format_list_fails_startup() {
        let runtime = SimulatedRuntime::new(SimulationConfig::default());
        runtime.handle().set_swapchain_formats(Vec::new());
        let result = XrApp::new(runtime, HeadlessBackend::new(), &test_config());
        assert!(matches!(result.err(), Some(XrError::Consistency(_))));
    }

    #[test]
    fn view_count_must_match_configuration() {
        let mut config = test_config();
        config.session.view_configuration = "mono".to_string();
        let result = app_with(SimulationConfig::default(), &config);
        assert!(matches!(result.err(), Some(XrError::Consistency(_))));

        let mono = SimulationConfig {
            view_count: 1,
            exit_after_frames: 5,
            ..SimulationConfig::default()
        };
        let (mut app, handle) = app_with(mono, &config).unwrap();
        app.run().unwrap();
        assert!(handle.count(|c| matches!(c, Call::EndFrame { views: 1, .. })) > 0);
    }

    #[test]
    fn blend_mode_falls_back_to_first() {
        assert_eq!(
            resolve_blend_mode(&[BlendMode::Additive, BlendMode::AlphaBlend], BlendMode::Opaque).unwrap(),
            BlendMode::Additive
        );
        assert_eq!(
            resolve_blend_mode(&[BlendMode::Opaque, BlendMode::AlphaBlend], BlendMode::AlphaBlend).unwrap(),
            BlendMode::AlphaBlend
        );
        assert!(resolve_blend_mode(&[], BlendMode::Opaque).is_err());
    }

    #[test]
    fn reference_space_prefers_local_fallback() {
        assert_eq!(
            resolve_reference_space(
                &[ReferenceSpaceType::View, ReferenceSpaceType::Local],
                ReferenceSpaceType::Stage
            )
            .unwrap(),
            ReferenceSpaceType::Local
        );
        assert_eq!(
            resolve_reference_space(&[ReferenceSpaceType::View], ReferenceSpaceType::Stage).unwrap(),
            ReferenceSpaceType::View
        );
        assert!(resolve_reference_space(&[], ReferenceSpaceType::Stage).is_err());
    }
}
