// Simulated runtime - deterministic in-process XR runtime
//
// Plays the runtime side of the session and swapchain protocol without a
// headset. It enforces the same call-ordering rules a conformant runtime
// does and answers misuse with the runtime's own status codes, so the
// session core can be exercised end to end in tests and in the default
// binary configuration.
//
// State is shared behind `Arc<Mutex<..>>`: swapchains live apart from the
// runtime object, and a `SimulationHandle` lets the owner script faults and
// read back a journal of the most recent calls.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec3;

use super::{
    BlendMode, CompositionSubmission, Event, Fov, FrameState, ImageWait, Pose, ReferenceSpaceType,
    Runtime, RuntimeSwapchain, SessionState, SwapchainCreateInfo, SwapchainId, TargetHandle, Time,
    View, ViewConfiguration, ViewConfigurationType, ViewConfigurationView, ViewStateFlags,
};
use crate::backend::{format, RenderError};
use crate::config::SimulationConfig;
use crate::error::{check, Completion, StatusCode, XrError, XrResult};

/// Half the default interpupillary distance, in meters.
const HALF_IPD: f32 = 0.032;
const EYE_HEIGHT: f32 = 1.6;
const START_TIME_NS: i64 = 1_000_000_000;

/// Runtime entry points that faults can be scripted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    PollEvent,
    BeginSession,
    EndSession,
    RequestExitSession,
    WaitFrame,
    BeginFrame,
    EndFrame,
    LocateViews,
    SyncActions,
    CreateSwapchain,
    EnumerateImages,
    AcquireImage,
    WaitImage,
    ReleaseImage,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::PollEvent => "xrPollEvent",
            Op::BeginSession => "xrBeginSession",
            Op::EndSession => "xrEndSession",
            Op::RequestExitSession => "xrRequestExitSession",
            Op::WaitFrame => "xrWaitFrame",
            Op::BeginFrame => "xrBeginFrame",
            Op::EndFrame => "xrEndFrame",
            Op::LocateViews => "xrLocateViews",
            Op::SyncActions => "xrSyncActions",
            Op::CreateSwapchain => "xrCreateSwapchain",
            Op::EnumerateImages => "xrEnumerateSwapchainImages",
            Op::AcquireImage => "xrAcquireSwapchainImage",
            Op::WaitImage => "xrWaitSwapchainImage",
            Op::ReleaseImage => "xrReleaseSwapchainImage",
        }
    }
}

/// One entry of the call journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PollEvent,
    BeginSession,
    EndSession,
    RequestExitSession,
    WaitFrame,
    BeginFrame,
    EndFrame { layers: usize, views: usize },
    LocateViews,
    SyncActions,
    CreateSwapchain,
    EnumerateImages(SwapchainId),
    AcquireImage(SwapchainId),
    WaitImage(SwapchainId),
    ReleaseImage(SwapchainId),
}

/// Source of the opaque handles a simulated swapchain hands out.
pub trait TargetAllocator {
    fn allocate(&mut self, info: &SwapchainCreateInfo, count: usize) -> Result<Vec<TargetHandle>, RenderError>;
}

/// Fake handles numbered from 1, nothing behind them.
#[derive(Debug, Default)]
pub struct SequentialTargets {
    next: u64,
}

impl TargetAllocator for SequentialTargets {
    fn allocate(&mut self, _info: &SwapchainCreateInfo, count: usize) -> Result<Vec<TargetHandle>, RenderError> {
        let targets = (0..count)
            .map(|_| {
                self.next += 1;
                TargetHandle(self.next)
            })
            .collect();
        Ok(targets)
    }
}

#[derive(Debug)]
struct SimSwapchain {
    images: Vec<TargetHandle>,
    next: u32,
    acquired: Option<u32>,
    waited: bool,
}

#[derive(Debug)]
struct SimState {
    config: SimulationConfig,
    autopilot: bool,
    started: bool,
    session_state: SessionState,
    running: bool,
    events: VecDeque<Event>,
    time: Time,
    frame_waited: bool,
    frame_begun: bool,
    frames_ended: u64,
    formats: Vec<i64>,
    swapchains: Vec<SimSwapchain>,
    journal: VecDeque<Call>,
    last_submission: Option<CompositionSubmission>,
    next_slot: Option<Instant>,
    faults: HashMap<Op, StatusCode>,
    view_state: ViewStateFlags,
    located_view_count: Option<usize>,
    pending_wait_timeouts: u32,
}

impl SimState {
    fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            autopilot: true,
            started: false,
            session_state: SessionState::Idle,
            running: false,
            events: VecDeque::new(),
            time: Time(START_TIME_NS),
            frame_waited: false,
            frame_begun: false,
            frames_ended: 0,
            formats: vec![
                format::R8G8B8A8_SRGB.code,
                format::R8G8B8A8_UNORM.code,
                format::R16G16B16A16_SFLOAT.code,
                format::A2B10G10R10_UNORM.code,
            ],
            swapchains: Vec::new(),
            journal: VecDeque::new(),
            last_submission: None,
            next_slot: None,
            faults: HashMap::new(),
            view_state: ViewStateFlags::ALL,
            located_view_count: None,
            pending_wait_timeouts: 0,
        }
    }

    /// Journal `call`, dropping the oldest entries past the configured depth.
    fn record(&mut self, call: Call) {
        if self.config.journal_depth == 0 {
            return;
        }
        while self.journal.len() >= self.config.journal_depth {
            self.journal.pop_front();
        }
        self.journal.push_back(call);
    }

    /// How long wait_frame blocks so consecutive frames sit one display
    /// period apart. The first wait returns at once.
    fn frame_pause(&mut self) -> Duration {
        if !self.config.paced {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let slot = self.next_slot.unwrap_or(now);
        self.next_slot = Some(slot.max(now) + self.display_period());
        slot.saturating_duration_since(now)
    }

    /// Take the scripted status for `op`. A scripted failure is returned as
    /// the error; anything else is handed back for the final `check`.
    fn scripted(&mut self, op: Op) -> XrResult<StatusCode> {
        let status = self.faults.remove(&op).unwrap_or(StatusCode::SUCCESS);
        if status.is_failure() {
            check(op.name(), status)?;
        }
        Ok(status)
    }

    fn transition(&mut self, state: SessionState) {
        self.session_state = state;
        self.events.push_back(Event::SessionStateChanged {
            state,
            time: self.time,
        });
    }

    fn display_period(&self) -> Duration {
        let hz = if self.config.refresh_rate_hz > 0.0 {
            self.config.refresh_rate_hz
        } else {
            90.0
        };
        Duration::from_secs_f64(1.0 / hz as f64)
    }

    fn request_exit(&mut self) {
        if self.session_state == SessionState::Focused {
            self.transition(SessionState::Visible);
        }
        if matches!(self.session_state, SessionState::Visible | SessionState::Ready) {
            self.transition(SessionState::Synchronized);
        }
        if self.session_state == SessionState::Synchronized {
            self.transition(SessionState::Stopping);
        }
    }

    fn after_frame(&mut self) {
        if !self.autopilot {
            return;
        }
        if self.config.exit_after_frames > 0 && self.frames_ended == self.config.exit_after_frames {
            log::info!("Simulated runtime requesting exit after {} frames", self.frames_ended);
            self.request_exit();
            return;
        }
        match self.session_state {
            SessionState::Synchronized if self.frames_ended >= 1 => self.transition(SessionState::Visible),
            SessionState::Visible if self.frames_ended >= 2 => self.transition(SessionState::Focused),
            _ => {}
        }
    }

    fn swapchain(&mut self, id: SwapchainId, op: Op) -> XrResult<&mut SimSwapchain> {
        self.swapchains
            .get_mut(id.0 as usize)
            .ok_or_else(|| XrError::runtime(op.name(), StatusCode::ERROR_HANDLE_INVALID))
    }
}

fn reject<T>(op: Op, status: StatusCode) -> XrResult<T> {
    log::error!("{} failed: {}", op.name(), status);
    Err(XrError::runtime(op.name(), status))
}

fn order_violation<T>(op: Op) -> XrResult<T> {
    reject(op, StatusCode::ERROR_CALL_ORDER_INVALID)
}

/// Scripting and inspection side of a simulated runtime.
#[derive(Clone)]
pub struct SimulationHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulationHandle {
    /// Make the next call to `op` fail (negative) or succeed with an advisory
    /// status (positive).
    pub fn script(&self, op: Op, status: StatusCode) {
        self.state.lock().faults.insert(op, status);
    }

    pub fn set_view_state(&self, flags: ViewStateFlags) {
        self.state.lock().view_state = flags;
    }

    /// Report a different number of located views than configured.
    pub fn set_located_view_count(&self, count: Option<usize>) {
        self.state.lock().located_view_count = count;
    }

    /// The next `count` image waits time out.
    pub fn time_out_image_waits(&self, count: u32) {
        self.state.lock().pending_wait_timeouts = count;
    }

    pub fn set_swapchain_formats(&self, formats: Vec<i64>) {
        self.state.lock().formats = formats;
    }

    /// Stop generating lifecycle events on our own.
    pub fn set_autopilot(&self, enabled: bool) {
        self.state.lock().autopilot = enabled;
    }

    pub fn push_event(&self, event: Event) {
        self.state.lock().events.push_back(event);
    }

    /// Move the runtime's session state and queue the matching notification.
    pub fn push_state(&self, state: SessionState) {
        self.state.lock().transition(state);
    }

    /// Walk the session down to `Stopping`, as a runtime does when the user
    /// quits from the system UI.
    pub fn request_exit(&self) {
        self.state.lock().request_exit();
    }

    pub fn session_state(&self) -> SessionState {
        self.state.lock().session_state
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn frames_ended(&self) -> u64 {
        self.state.lock().frames_ended
    }

    /// Most recent calls, oldest first (at most `journal_depth` of them).
    pub fn journal(&self) -> Vec<Call> {
        self.state.lock().journal.iter().cloned().collect()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().journal.iter().filter(|call| predicate(*call)).count()
    }

    pub fn last_submission(&self) -> Option<CompositionSubmission> {
        self.state.lock().last_submission.clone()
    }

    /// Images currently acquired and not yet released, across all swapchains.
    pub fn outstanding_images(&self) -> usize {
        self.state
            .lock()
            .swapchains
            .iter()
            .filter(|swapchain| swapchain.acquired.is_some())
            .count()
    }
}

pub struct SimulatedRuntime {
    state: Arc<Mutex<SimState>>,
    targets: Box<dyn TargetAllocator>,
}

impl SimulatedRuntime {
    pub fn new(config: SimulationConfig) -> Self {
        Self::with_targets(config, Box::new(SequentialTargets::default()))
    }

    pub fn with_targets(config: SimulationConfig, targets: Box<dyn TargetAllocator>) -> Self {
        log::info!(
            "Simulated runtime: {} view(s) at {}x{}, {} images per swapchain, {} Hz",
            config.view_count,
            config.recommended_width,
            config.recommended_height,
            config.ring_size,
            config.refresh_rate_hz
        );
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
            targets,
        }
    }

    pub fn handle(&self) -> SimulationHandle {
        SimulationHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Runtime for SimulatedRuntime {
    type Swapchain = SimulatedSwapchain;

    fn poll_event(&mut self) -> XrResult<Option<Event>> {
        let mut sim = self.state.lock();
        sim.record(Call::PollEvent);
        sim.scripted(Op::PollEvent)?;

        if sim.autopilot && !sim.started {
            sim.started = true;
            sim.transition(SessionState::Idle);
            sim.transition(SessionState::Ready);
        }
        Ok(sim.events.pop_front())
    }

    fn begin_session(&mut self, view_configuration: ViewConfigurationType) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::BeginSession);
        let status = sim.scripted(Op::BeginSession)?;

        if sim.running {
            return reject(Op::BeginSession, StatusCode::ERROR_SESSION_RUNNING);
        }
        if sim.session_state != SessionState::Ready {
            return reject(Op::BeginSession, StatusCode::ERROR_SESSION_NOT_READY);
        }

        log::debug!("Simulated session begun ({:?})", view_configuration);
        sim.running = true;
        if sim.autopilot {
            sim.transition(SessionState::Synchronized);
        }
        check(Op::BeginSession.name(), status)
    }

    fn end_session(&mut self) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::EndSession);
        let status = sim.scripted(Op::EndSession)?;

        if !sim.running {
            return reject(Op::EndSession, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        if sim.session_state != SessionState::Stopping {
            return reject(Op::EndSession, StatusCode::ERROR_SESSION_NOT_STOPPING);
        }

        sim.running = false;
        sim.frame_waited = false;
        sim.frame_begun = false;
        if sim.autopilot {
            sim.transition(SessionState::Idle);
            sim.transition(SessionState::Exiting);
        }
        check(Op::EndSession.name(), status)
    }

    fn request_exit_session(&mut self) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::RequestExitSession);
        if !sim.running {
            return reject(Op::RequestExitSession, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        sim.request_exit();
        Ok(Completion::Success)
    }

    fn wait_frame(&mut self) -> XrResult<FrameState> {
        let (status, pause) = {
            let mut sim = self.state.lock();
            sim.record(Call::WaitFrame);
            let status = sim.scripted(Op::WaitFrame)?;

            if !sim.running {
                return reject(Op::WaitFrame, StatusCode::ERROR_SESSION_NOT_RUNNING);
            }
            if sim.frame_waited {
                return order_violation(Op::WaitFrame);
            }
            (status, sim.frame_pause())
        };
        // Sleep without the lock so handles stay usable
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }

        let mut sim = self.state.lock();
        let period = sim.display_period();
        sim.time = Time(sim.time.as_nanos() + period.as_nanos() as i64);
        sim.frame_waited = true;
        check(Op::WaitFrame.name(), status)?;

        Ok(FrameState {
            predicted_display_time: sim.time,
            predicted_display_period: period,
            should_render: sim.config.should_render && sim.session_state.renders(),
        })
    }

    fn begin_frame(&mut self) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::BeginFrame);
        let mut status = sim.scripted(Op::BeginFrame)?;

        if !sim.running {
            return reject(Op::BeginFrame, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        if !sim.frame_waited {
            return order_violation(Op::BeginFrame);
        }
        if sim.frame_begun {
            // The previous frame was never ended; a runtime drops it.
            status = StatusCode::FRAME_DISCARDED;
        }

        sim.frame_waited = false;
        sim.frame_begun = true;
        check(Op::BeginFrame.name(), status)
    }

    fn end_frame(&mut self, submission: &CompositionSubmission) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::EndFrame {
            layers: submission.layers.len(),
            views: submission.view_count(),
        });
        let status = sim.scripted(Op::EndFrame)?;

        if !sim.running {
            return reject(Op::EndFrame, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        if !sim.frame_begun {
            return order_violation(Op::EndFrame);
        }
        if submission.display_time != sim.time {
            return reject(Op::EndFrame, StatusCode::ERROR_TIME_INVALID);
        }

        let view_count = sim.config.view_count;
        for layer in &submission.layers {
            if layer.views.len() != view_count {
                return reject(Op::EndFrame, StatusCode::ERROR_VALIDATION_FAILURE);
            }
            for view in &layer.views {
                let released = sim
                    .swapchains
                    .get(view.sub_image.swapchain.0 as usize)
                    .map(|swapchain| swapchain.acquired.is_none())
                    .unwrap_or(false);
                if !released {
                    return reject(Op::EndFrame, StatusCode::ERROR_LAYER_INVALID);
                }
            }
        }

        sim.frame_begun = false;
        sim.frames_ended += 1;
        sim.last_submission = Some(submission.clone());
        sim.after_frame();
        check(Op::EndFrame.name(), status)
    }

    fn locate_views(
        &mut self,
        display_time: Time,
        space: ReferenceSpaceType,
    ) -> XrResult<(ViewStateFlags, Vec<View>)> {
        let mut sim = self.state.lock();
        sim.record(Call::LocateViews);
        let status = sim.scripted(Op::LocateViews)?;

        if !sim.running {
            return reject(Op::LocateViews, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        if display_time.as_nanos() <= 0 {
            return reject(Op::LocateViews, StatusCode::ERROR_TIME_INVALID);
        }
        check(Op::LocateViews.name(), status)?;

        let count = sim.located_view_count.unwrap_or(sim.config.view_count);
        let height = if space == ReferenceSpaceType::Stage { EYE_HEIGHT } else { 0.0 };
        let views = (0..count)
            .map(|i| {
                let side = if count == 1 { 0.0 } else if i == 0 { -1.0 } else { 1.0 };
                View {
                    pose: Pose {
                        position: Vec3::new(side * HALF_IPD, height, 0.0),
                        ..Pose::IDENTITY
                    },
                    fov: Fov::symmetric(0.8),
                }
            })
            .collect();
        Ok((sim.view_state, views))
    }

    fn sync_actions(&mut self) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::SyncActions);
        let mut status = sim.scripted(Op::SyncActions)?;

        if !sim.running {
            return reject(Op::SyncActions, StatusCode::ERROR_SESSION_NOT_RUNNING);
        }
        if sim.session_state != SessionState::Focused && status == StatusCode::SUCCESS {
            status = StatusCode::SESSION_NOT_FOCUSED;
        }
        check(Op::SyncActions.name(), status)
    }

    fn view_configuration(&mut self, kind: ViewConfigurationType) -> XrResult<ViewConfiguration> {
        let sim = self.state.lock();
        let view = ViewConfigurationView {
            recommended_width: sim.config.recommended_width,
            recommended_height: sim.config.recommended_height,
            max_width: sim.config.recommended_width * 2,
            max_height: sim.config.recommended_height * 2,
            recommended_sample_count: 1,
            max_sample_count: 4,
        };
        Ok(ViewConfiguration::new(kind, vec![view; sim.config.view_count]))
    }

    fn environment_blend_modes(&mut self, _kind: ViewConfigurationType) -> XrResult<Vec<BlendMode>> {
        Ok(vec![BlendMode::Opaque, BlendMode::AlphaBlend])
    }

    fn reference_spaces(&mut self) -> XrResult<Vec<ReferenceSpaceType>> {
        Ok(vec![
            ReferenceSpaceType::View,
            ReferenceSpaceType::Local,
            ReferenceSpaceType::Stage,
        ])
    }

    fn swapchain_formats(&mut self) -> XrResult<Vec<i64>> {
        Ok(self.state.lock().formats.clone())
    }

    fn create_swapchain(&mut self, info: &SwapchainCreateInfo) -> XrResult<SimulatedSwapchain> {
        let mut sim = self.state.lock();
        sim.record(Call::CreateSwapchain);
        let status = sim.scripted(Op::CreateSwapchain)?;

        if !sim.formats.contains(&info.format) {
            return reject(Op::CreateSwapchain, StatusCode::ERROR_SWAPCHAIN_FORMAT_UNSUPPORTED);
        }

        let images = self.targets.allocate(info, sim.config.ring_size)?;
        let id = SwapchainId(sim.swapchains.len() as u64);
        sim.swapchains.push(SimSwapchain {
            images,
            next: 0,
            acquired: None,
            waited: false,
        });
        check(Op::CreateSwapchain.name(), status)?;

        log::debug!(
            "Created simulated swapchain {:?}: {}x{} {}",
            id,
            info.extent.width,
            info.extent.height,
            format::format_name(info.format)
        );
        Ok(SimulatedSwapchain {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct SimulatedSwapchain {
    id: SwapchainId,
    state: Arc<Mutex<SimState>>,
}

impl RuntimeSwapchain for SimulatedSwapchain {
    fn id(&self) -> SwapchainId {
        self.id
    }

    fn enumerate_images(&mut self) -> XrResult<Vec<TargetHandle>> {
        let mut sim = self.state.lock();
        sim.record(Call::EnumerateImages(self.id));
        let status = sim.scripted(Op::EnumerateImages)?;
        let images = sim.swapchain(self.id, Op::EnumerateImages)?.images.clone();
        check(Op::EnumerateImages.name(), status)?;
        Ok(images)
    }

    fn acquire_image(&mut self) -> XrResult<u32> {
        let mut sim = self.state.lock();
        sim.record(Call::AcquireImage(self.id));
        let status = sim.scripted(Op::AcquireImage)?;

        let swapchain = sim.swapchain(self.id, Op::AcquireImage)?;
        if swapchain.acquired.is_some() {
            return order_violation(Op::AcquireImage);
        }
        let index = swapchain.next;
        swapchain.next = (index + 1) % swapchain.images.len().max(1) as u32;
        swapchain.acquired = Some(index);
        swapchain.waited = false;

        check(Op::AcquireImage.name(), status)?;
        Ok(index)
    }

    fn wait_image(&mut self, timeout: Duration) -> XrResult<ImageWait> {
        let mut sim = self.state.lock();
        sim.record(Call::WaitImage(self.id));
        let status = sim.scripted(Op::WaitImage)?;

        let timed_out = if sim.pending_wait_timeouts > 0 {
            sim.pending_wait_timeouts -= 1;
            true
        } else {
            false
        };

        let swapchain = sim.swapchain(self.id, Op::WaitImage)?;
        if swapchain.acquired.is_none() {
            return order_violation(Op::WaitImage);
        }
        // A timed-out wait still counts as the wait preceding release.
        swapchain.waited = true;

        if timed_out {
            log::trace!("Simulated wait on {:?} timed out after {:?}", self.id, timeout);
            return Ok(ImageWait::TimedOut);
        }
        check(Op::WaitImage.name(), status)?;
        Ok(ImageWait::Ready)
    }

    fn release_image(&mut self) -> XrResult<Completion> {
        let mut sim = self.state.lock();
        sim.record(Call::ReleaseImage(self.id));
        let status = sim.scripted(Op::ReleaseImage)?;

        let swapchain = sim.swapchain(self.id, Op::ReleaseImage)?;
        if swapchain.acquired.is_none() || !swapchain.waited {
            return order_violation(Op::ReleaseImage);
        }
        swapchain.acquired = None;
        swapchain.waited = false;
        check(Op::ReleaseImage.name(), status)
    }
}
