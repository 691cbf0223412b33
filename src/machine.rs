//! Finite-State Orchestrator with Priority Preemption
//!
//! The control loop runs exactly one `step()` per tick. Before the current
//! state's handler is invoked, a registered priority resolver gets a chance
//! to preempt: if it names a target state, the machine transitions there and
//! runs *that* state's handler in the same tick. Preemption is never
//! deferred to the next tick.

use std::collections::HashMap;

use tracing::{debug, info};

/// Control states. Every state must have a registered handler; a hole in
/// the registry is a wiring bug, not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Scan the surface for actionable target markers
    ScanForTargets,
    /// Act on the next queued target
    ActOnTarget,
    /// Look for the secondary confirmation element and click it if present
    CheckSecondaryCondition,
    /// Search for the anchor element with retries
    SearchAnchor,
    /// Hold the pointer on the anchor for a bounded duration
    HoldAnchor,
    /// Drag the view to expose new surface area
    Sweep,
    /// Open and work the attribute panel
    AdjustAttribute,
    /// Collect incidental pickups and decide whether to stay or sweep
    Reposition,
    /// A priority marker was seen during scanning; drive the fixed sequence
    CheckPriorityEvent,
    /// Resolve the priority event (stage transition)
    HandlePriorityEvent,
    /// Wait for the surface to settle after a priority event
    AwaitRecovery,
}

impl State {
    pub const ALL: [State; 11] = [
        State::ScanForTargets,
        State::ActOnTarget,
        State::CheckSecondaryCondition,
        State::SearchAnchor,
        State::HoldAnchor,
        State::Sweep,
        State::AdjustAttribute,
        State::Reposition,
        State::CheckPriorityEvent,
        State::HandlePriorityEvent,
        State::AwaitRecovery,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            State::ScanForTargets => "ScanForTargets",
            State::ActOnTarget => "ActOnTarget",
            State::CheckSecondaryCondition => "CheckSecondaryCondition",
            State::SearchAnchor => "SearchAnchor",
            State::HoldAnchor => "HoldAnchor",
            State::Sweep => "Sweep",
            State::AdjustAttribute => "AdjustAttribute",
            State::Reposition => "Reposition",
            State::CheckPriorityEvent => "CheckPriorityEvent",
            State::HandlePriorityEvent => "HandlePriorityEvent",
            State::AwaitRecovery => "AwaitRecovery",
        }
    }
}

/// A state handler: runs one unit of work and returns the next state,
/// or `None` to stay put.
pub type Handler<C> = fn(&mut C) -> Option<State>;

/// Consulted before every handler invocation. Returning a state preempts
/// whatever the current handler would have done.
pub type PriorityResolver<C> = fn(&mut C) -> Option<State>;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("no handler registered for state {0}")]
    MissingHandler(&'static str),
}

/// State machine generic over the context handed to handlers each step.
pub struct StateMachine<C> {
    current: State,
    previous: Option<State>,
    handlers: HashMap<State, Handler<C>>,
    priority_resolver: Option<PriorityResolver<C>>,
}

impl<C> StateMachine<C> {
    pub fn new(initial: State) -> Self {
        info!(state = initial.name(), "state machine initialized");
        Self {
            current: initial,
            previous: None,
            handlers: HashMap::new(),
            priority_resolver: None,
        }
    }

    pub fn register(&mut self, state: State, handler: Handler<C>) {
        debug!(state = state.name(), "handler registered");
        self.handlers.insert(state, handler);
    }

    pub fn set_priority_resolver(&mut self, resolver: PriorityResolver<C>) {
        debug!("priority resolver registered");
        self.priority_resolver = Some(resolver);
    }

    /// Fail fast on registry holes before the loop starts.
    pub fn verify(&self) -> Result<(), MachineError> {
        for state in State::ALL {
            if !self.handlers.contains_key(&state) {
                return Err(MachineError::MissingHandler(state.name()));
            }
        }
        Ok(())
    }

    pub fn state(&self) -> State {
        self.current
    }

    pub fn previous(&self) -> Option<State> {
        self.previous
    }

    fn transition(&mut self, next: State) {
        if next != self.current {
            info!(from = self.current.name(), to = next.name(), "state transition");
            self.previous = Some(self.current);
            self.current = next;
        }
    }

    /// Run one orchestrator step: priority resolver first, then the handler
    /// for whatever state we end up in.
    pub fn step(&mut self, ctx: &mut C) -> Result<(), MachineError> {
        if let Some(resolver) = self.priority_resolver {
            if let Some(target) = resolver(ctx) {
                debug!(target = target.name(), "priority resolver preempted");
                self.transition(target);
            }
        }

        let handler = *self
            .handlers
            .get(&self.current)
            .ok_or(MachineError::MissingHandler(self.current.name()))?;

        if let Some(next) = handler(ctx) {
            self.transition(next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCtx {
        handler_ran: Vec<State>,
        preempt: Option<State>,
    }

    fn noop(_: &mut TestCtx) -> Option<State> {
        None
    }

    fn full_machine() -> StateMachine<TestCtx> {
        let mut m = StateMachine::new(State::ScanForTargets);
        for state in State::ALL {
            m.register(state, noop);
        }
        m
    }

    #[test]
    fn verify_flags_missing_handler() {
        let mut m: StateMachine<TestCtx> = StateMachine::new(State::ScanForTargets);
        m.register(State::ScanForTargets, noop);
        assert!(matches!(m.verify(), Err(MachineError::MissingHandler(_))));

        let full = full_machine();
        assert!(full.verify().is_ok());
    }

    #[test]
    fn handler_return_drives_transition() {
        let mut m = full_machine();
        m.register(State::ScanForTargets, |ctx| {
            ctx.handler_ran.push(State::ScanForTargets);
            Some(State::Sweep)
        });
        let mut ctx = TestCtx { handler_ran: Vec::new(), preempt: None };
        m.step(&mut ctx).unwrap();
        assert_eq!(m.state(), State::Sweep);
        assert_eq!(m.previous(), Some(State::ScanForTargets));
    }

    #[test]
    fn preemption_always_wins() {
        let mut m = full_machine();
        // Handler would go to Sweep, but the resolver preempts to
        // HandlePriorityEvent and that state's handler runs this tick.
        m.register(State::ScanForTargets, |_| Some(State::Sweep));
        m.register(State::HandlePriorityEvent, |ctx| {
            ctx.handler_ran.push(State::HandlePriorityEvent);
            None
        });
        m.set_priority_resolver(|ctx| ctx.preempt.take());

        let mut ctx = TestCtx {
            handler_ran: Vec::new(),
            preempt: Some(State::HandlePriorityEvent),
        };
        m.step(&mut ctx).unwrap();
        assert_eq!(m.state(), State::HandlePriorityEvent);
        assert_eq!(ctx.handler_ran, vec![State::HandlePriorityEvent]);

        // No pending preemption: normal dispatch resumes.
        m.step(&mut ctx).unwrap();
        assert_eq!(ctx.handler_ran.len(), 2);
    }

    #[test]
    fn step_errors_on_unregistered_state() {
        let mut m: StateMachine<TestCtx> = StateMachine::new(State::AwaitRecovery);
        let mut ctx = TestCtx { handler_ran: Vec::new(), preempt: None };
        assert!(m.step(&mut ctx).is_err());
    }
}
