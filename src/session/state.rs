// Session state machine
//
// Lifecycle state changes only in response to runtime notifications. The
// machine owns the begin/end session calls that the lifecycle demands and
// answers the loop's questions: may a frame run, may it render, may input
// be synchronized.

use crate::error::XrResult;
use crate::runtime::{Event, Runtime, SessionState, ViewConfigurationType};

/// What a delivered event did to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Transition { from: SessionState, to: SessionState },
    /// Notification for the state we are already in.
    Duplicate(SessionState),
    /// Edge the lifecycle does not allow; state left unchanged.
    Illegal { from: SessionState, to: SessionState },
    /// Not a lifecycle event.
    Ignored,
}

#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    view_configuration: ViewConfigurationType,
    begun: bool,
    running: bool,
    rejected_begins: u32,
}

impl SessionStateMachine {
    pub fn new(view_configuration: ViewConfigurationType) -> Self {
        Self {
            state: SessionState::Idle,
            view_configuration,
            begun: false,
            running: false,
            rejected_begins: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Between a successful begin and the matching end.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Frames (wait/begin/end) are due in this state.
    pub fn frame_loop_active(&self) -> bool {
        self.running
            && matches!(
                self.state,
                SessionState::Ready | SessionState::Synchronized | SessionState::Visible | SessionState::Focused
            )
    }

    pub fn rendering_authorized(&self) -> bool {
        self.running && self.state.renders()
    }

    pub fn input_authorized(&self) -> bool {
        self.running && self.state.accepts_input()
    }

    /// `Ready` notifications that arrived after the one begin was spent.
    pub fn rejected_begins(&self) -> u32 {
        self.rejected_begins
    }

    /// Apply one runtime notification. Errors come only from the begin/end
    /// session calls and are fatal.
    pub fn handle_event<R: Runtime>(&mut self, runtime: &mut R, event: Event) -> XrResult<Dispatch> {
        match event {
            Event::SessionStateChanged { state, time } => {
                log::debug!("Session state event at {} ns: {}", time.as_nanos(), state.as_str());
                self.apply(runtime, state)
            }
            Event::InstanceLossPending { loss_time } => {
                log::warn!("Instance loss pending at {} ns", loss_time.as_nanos());
                let from = self.state;
                if from.is_terminal() {
                    return Ok(Dispatch::Duplicate(from));
                }
                self.state = SessionState::LossPending;
                Ok(Dispatch::Transition {
                    from,
                    to: SessionState::LossPending,
                })
            }
            Event::EventsLost { lost_event_count } => {
                log::warn!("Runtime event queue overflowed, {} events lost", lost_event_count);
                Ok(Dispatch::Ignored)
            }
            Event::InteractionProfileChanged => {
                log::info!("Interaction profile changed");
                Ok(Dispatch::Ignored)
            }
            Event::ReferenceSpaceChangePending { space } => {
                log::info!("Reference space change pending: {:?}", space);
                Ok(Dispatch::Ignored)
            }
            Event::DisplayRefreshRateChanged { from_hz, to_hz } => {
                log::info!("Display refresh rate {:.1} Hz -> {:.1} Hz", from_hz, to_hz);
                Ok(Dispatch::Ignored)
            }
            other => {
                log::debug!("Ignoring event {:?}", other);
                Ok(Dispatch::Ignored)
            }
        }
    }

    fn apply<R: Runtime>(&mut self, runtime: &mut R, to: SessionState) -> XrResult<Dispatch> {
        let from = self.state;
        if from == to {
            log::warn!("Duplicate session state notification: {}", to.as_str());
            return Ok(Dispatch::Duplicate(to));
        }
        if !is_legal(from, to) {
            log::warn!("Rejected session transition {} -> {}", from.as_str(), to.as_str());
            return Ok(Dispatch::Illegal { from, to });
        }

        self.state = to;
        log::info!("Session state: {} -> {}", from.as_str(), to.as_str());

        match to {
            SessionState::Ready => self.begin(runtime)?,
            SessionState::Stopping => self.end(runtime)?,
            SessionState::Exiting => log::info!("Session exiting"),
            SessionState::LossPending => log::warn!("Session loss pending"),
            _ => {}
        }

        Ok(Dispatch::Transition { from, to })
    }

    fn begin<R: Runtime>(&mut self, runtime: &mut R) -> XrResult<()> {
        if self.begun {
            self.rejected_begins += 1;
            log::warn!("Session was already begun once; not beginning it again");
            return Ok(());
        }
        self.begun = true;
        runtime.begin_session(self.view_configuration)?;
        self.running = true;
        log::info!("Session begun ({:?})", self.view_configuration);
        Ok(())
    }

    fn end<R: Runtime>(&mut self, runtime: &mut R) -> XrResult<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        runtime.end_session()?;
        log::info!("Session ended");
        Ok(())
    }
}

fn is_legal(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (_, Exiting)
            | (_, LossPending)
            | (Idle, Ready)
            | (Ready, Synchronized)
            | (Synchronized, Visible)
            | (Visible, Focused)
            | (Focused, Visible)
            | (Visible, Synchronized)
            | (Synchronized, Stopping)
            | (Stopping, Idle)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::StatusCode;
    use crate::runtime::simulated::{Call, Op, SimulatedRuntime, SimulationHandle};
    use crate::runtime::Time;

    fn scripted_runtime() -> (SimulatedRuntime, SimulationHandle) {
        let runtime = SimulatedRuntime::new(SimulationConfig::default());
        let handle = runtime.handle();
        handle.set_autopilot(false);
        (runtime, handle)
    }

    fn deliver(machine: &mut SessionStateMachine, runtime: &mut SimulatedRuntime) -> XrResult<Dispatch> {
        let event = runtime.poll_event()?.expect("event queued");
        machine.handle_event(runtime, event)
    }

    fn walk(machine: &mut SessionStateMachine, runtime: &mut SimulatedRuntime, handle: &SimulationHandle, states: &[SessionState]) {
        for &state in states {
            handle.push_state(state);
            deliver(machine, runtime).unwrap();
        }
    }

    #[test]
    fn ready_begins_session_once() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        handle.push_state(SessionState::Ready);
        assert_eq!(
            deliver(&mut machine, &mut runtime).unwrap(),
            Dispatch::Transition {
                from: SessionState::Idle,
                to: SessionState::Ready
            }
        );
        assert!(machine.is_running());

        handle.push_state(SessionState::Ready);
        assert_eq!(
            deliver(&mut machine, &mut runtime).unwrap(),
            Dispatch::Duplicate(SessionState::Ready)
        );
        assert_eq!(handle.count(|c| *c == Call::BeginSession), 1);
    }

    #[test]
    fn forward_walk_authorizes_by_state() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        walk(&mut machine, &mut runtime, &handle, &[SessionState::Ready]);
        assert!(machine.frame_loop_active());
        assert!(!machine.rendering_authorized());

        walk(&mut machine, &mut runtime, &handle, &[SessionState::Synchronized, SessionState::Visible]);
        assert!(machine.rendering_authorized());
        assert!(!machine.input_authorized());

        walk(&mut machine, &mut runtime, &handle, &[SessionState::Focused]);
        assert!(machine.rendering_authorized());
        assert!(machine.input_authorized());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        handle.push_state(SessionState::Focused);
        assert_eq!(
            deliver(&mut machine, &mut runtime).unwrap(),
            Dispatch::Illegal {
                from: SessionState::Idle,
                to: SessionState::Focused
            }
        );
        assert_eq!(machine.state(), SessionState::Idle);
        assert_eq!(handle.count(|c| *c == Call::BeginSession), 0);
    }

    #[test]
    fn stopping_ends_session_and_later_ready_is_not_begun() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        walk(
            &mut machine,
            &mut runtime,
            &handle,
            &[SessionState::Ready, SessionState::Synchronized, SessionState::Stopping],
        );
        assert!(!machine.is_running());
        assert!(!machine.frame_loop_active());
        assert_eq!(handle.count(|c| *c == Call::EndSession), 1);

        walk(&mut machine, &mut runtime, &handle, &[SessionState::Idle, SessionState::Ready]);
        assert_eq!(machine.state(), SessionState::Ready);
        assert_eq!(machine.rejected_begins(), 1);
        assert_eq!(handle.count(|c| *c == Call::BeginSession), 1);
    }

    #[test]
    fn loss_pending_is_terminal() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);
        walk(&mut machine, &mut runtime, &handle, &[SessionState::Ready]);

        handle.push_event(Event::InstanceLossPending { loss_time: Time(42) });
        deliver(&mut machine, &mut runtime).unwrap();
        assert_eq!(machine.state(), SessionState::LossPending);
        assert!(machine.is_terminal());

        handle.push_state(SessionState::Synchronized);
        assert!(matches!(
            deliver(&mut machine, &mut runtime).unwrap(),
            Dispatch::Illegal { .. }
        ));
    }

    #[test]
    fn unknown_events_are_ignored() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        handle.push_event(Event::Unknown { type_code: Some(1_000_999) });
        handle.push_event(Event::EventsLost { lost_event_count: 3 });
        handle.push_event(Event::PerfSettings);
        for _ in 0..3 {
            assert_eq!(deliver(&mut machine, &mut runtime).unwrap(), Dispatch::Ignored);
        }
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn begin_failure_is_fatal() {
        let (mut runtime, handle) = scripted_runtime();
        let mut machine = SessionStateMachine::new(ViewConfigurationType::PrimaryStereo);

        handle.script(Op::BeginSession, StatusCode::ERROR_RUNTIME_FAILURE);
        handle.push_state(SessionState::Ready);
        let err = deliver(&mut machine, &mut runtime).unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::ERROR_RUNTIME_FAILURE));
        assert!(!machine.is_running());
    }

    #[test]
    fn exiting_from_any_live_state() {
        assert!(is_legal(SessionState::Idle, SessionState::Exiting));
        assert!(is_legal(SessionState::Focused, SessionState::LossPending));
        assert!(!is_legal(SessionState::Exiting, SessionState::Idle));
        assert!(!is_legal(SessionState::Ready, SessionState::Visible));
        assert!(!is_legal(SessionState::Stopping, SessionState::Ready));
    }
}
