//! Protocol step engine
//!
//! A workflow is a [`Machine`]: a table of named [`State`]s over a
//! per-run context `C`. Each state runs one [`Step`], then its guards
//! pick the next state in declaration order. Step failures go through
//! [`recover`](crate::recovery::recover) under the state's [`OnError`]
//! policy.
//!
//! Steps are plain function pointers so the table stays structural and
//! the logic lives in named functions next to it.

use crate::config::EngineConfig;
use crate::device::{Device, DeviceSession};
use crate::error::{Fault, Result};
use crate::recovery::{recover, Expected, OnError, Resolution, RetryBudget};
use futures::future::BoxFuture;
use rps_wsman::{Envelope, WsmanCall};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event emitted while workflows run
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Workflow started
    Started {
        client_id: String,
        workflow: &'static str,
    },
    /// A state was entered
    StateEntered {
        client_id: String,
        workflow: &'static str,
        state: &'static str,
    },
    /// Workflow reached a terminal state
    Completed {
        client_id: String,
        workflow: &'static str,
        success: bool,
    },
}

/// Terminal result of a machine run
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failed(Fault),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::Failed(fault) => Err(fault),
        }
    }
}

pub type BuildFn<C> = fn(&C, &DeviceSession) -> Result<WsmanCall>;
pub type ResponseFn<C> = fn(&mut C, &Envelope) -> Result<()>;
pub type StoreFn<C> = fn(&mut C, Vec<Value>) -> Result<()>;
pub type TaskFn<C> = for<'a> fn(&'a mut C, &'a mut Device) -> BoxFuture<'a, Result<()>>;
pub type Predicate<C> = fn(&C) -> bool;

/// What a state does when entered
pub enum Step<C> {
    /// One WS-Man round trip
    Call {
        build: BuildFn<C>,
        on_response: ResponseFn<C>,
    },
    /// Enumerate a class; the context is kept for the next `Pull`
    Enumerate(&'static str),
    /// Pull the items of the last enumeration
    Pull {
        class: &'static str,
        store: StoreFn<C>,
    },
    /// Arbitrary async work, possibly several calls or collaborator I/O
    Task(TaskFn<C>),
    /// Nested workflow; its failure fails this machine
    Child {
        workflow: &'static str,
        run: TaskFn<C>,
    },
    /// Guards only
    Decide,
    /// Fixed settle time
    Delay(fn(&EngineConfig) -> Duration),
    Success,
    Failure(fn(&C) -> Fault),
}

pub struct Guard<C> {
    pub name: &'static str,
    pub when: Predicate<C>,
    pub target: &'static str,
}

pub struct State<C> {
    pub name: &'static str,
    pub step: Step<C>,
    pub guards: Vec<Guard<C>>,
    pub on_error: OnError,
    /// Re-sends allowed on malformed responses; defaults to the engine setting
    pub retries: Option<u32>,
}

fn always<C>(_: &C) -> bool {
    true
}

impl<C> State<C> {
    pub fn new(name: &'static str, step: Step<C>) -> Self {
        Self {
            name,
            step,
            guards: Vec::new(),
            on_error: OnError::Recover,
            retries: None,
        }
    }

    pub fn call(name: &'static str, build: BuildFn<C>, on_response: ResponseFn<C>) -> Self {
        Self::new(name, Step::Call { build, on_response })
    }

    pub fn enumerate(name: &'static str, class: &'static str) -> Self {
        Self::new(name, Step::Enumerate(class))
    }

    pub fn pull(name: &'static str, class: &'static str, store: StoreFn<C>) -> Self {
        Self::new(name, Step::Pull { class, store })
    }

    pub fn task(name: &'static str, task: TaskFn<C>) -> Self {
        Self::new(name, Step::Task(task))
    }

    pub fn child(name: &'static str, workflow: &'static str, run: TaskFn<C>) -> Self {
        Self::new(name, Step::Child { workflow, run })
    }

    pub fn decide(name: &'static str) -> Self {
        Self::new(name, Step::Decide)
    }

    pub fn delay(name: &'static str, delay: fn(&EngineConfig) -> Duration) -> Self {
        Self::new(name, Step::Delay(delay))
    }

    pub fn success(name: &'static str) -> Self {
        Self::new(name, Step::Success)
    }

    pub fn failure(name: &'static str, fault: fn(&C) -> Fault) -> Self {
        Self::new(name, Step::Failure(fault))
    }

    /// Add a guarded transition; guards are tried in the order added
    pub fn when(mut self, name: &'static str, when: Predicate<C>, target: &'static str) -> Self {
        self.guards.push(Guard { name, when, target });
        self
    }

    /// Unconditional transition, tried after any earlier guards
    pub fn then(mut self, target: &'static str) -> Self {
        self.guards.push(Guard {
            name: "always",
            when: always::<C>,
            target,
        });
        self
    }

    pub fn expect(mut self, expected: Expected, resume: &'static str) -> Self {
        self.on_error = OnError::Expect { expected, resume };
        self
    }

    pub fn tolerate(mut self, resume: &'static str) -> Self {
        self.on_error = OnError::Tolerate { resume };
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    fn is_terminal(&self) -> bool {
        matches!(self.step, Step::Success | Step::Failure(_))
    }
}

/// A workflow definition
pub struct Machine<C> {
    name: &'static str,
    initial: &'static str,
    states: Vec<State<C>>,
}

enum StepResult {
    Next,
    ChildFailed(Fault),
    Error(Fault),
}

impl<C: Send> Machine<C> {
    pub fn new(name: &'static str, initial: &'static str) -> Self {
        Self {
            name,
            initial,
            states: Vec::new(),
        }
    }

    pub fn state(mut self, state: State<C>) -> Self {
        self.states.push(state);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get(&self, name: &str) -> Option<&State<C>> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Every transition target names a state of this machine
    pub fn validate(&self) -> Result<()> {
        let known = |target: &str| self.get(target).is_some();
        if !known(self.initial) {
            return Err(Fault::failed(format!("{}: unknown initial state {}", self.name, self.initial)));
        }
        for state in &self.states {
            let mut targets: Vec<&str> = state.guards.iter().map(|g| g.target).collect();
            match state.on_error {
                OnError::Expect { resume, .. } | OnError::Tolerate { resume } => targets.push(resume),
                OnError::Recover => {}
            }
            if let Some(missing) = targets.into_iter().find(|t| !known(*t)) {
                return Err(Fault::failed(format!(
                    "{}: state {} points at unknown state {missing}",
                    self.name, state.name
                )));
            }
            if state.guards.is_empty() && !state.is_terminal() {
                return Err(Fault::failed(format!("{}: state {} has no way out", self.name, state.name)));
            }
        }
        Ok(())
    }

    /// Run the machine to a terminal state
    pub async fn run(&self, ctx: &mut C, device: &mut Device) -> Outcome {
        let client_id = device.client_id().to_string();
        info!(client_id = %client_id, workflow = self.name, "Starting workflow");
        device.emit(WorkflowEvent::Started {
            client_id: client_id.clone(),
            workflow: self.name,
        });

        let outcome = self.drive(ctx, device, &client_id).await;

        match &outcome {
            Outcome::Success => info!(client_id = %client_id, workflow = self.name, "Workflow succeeded"),
            Outcome::Failed(fault) => {
                warn!(client_id = %client_id, workflow = self.name, %fault, "Workflow failed")
            }
        }
        device.emit(WorkflowEvent::Completed {
            client_id,
            workflow: self.name,
            success: outcome.is_success(),
        });
        outcome
    }

    async fn drive(&self, ctx: &mut C, device: &mut Device, client_id: &str) -> Outcome {
        let mut enumeration_context: Option<String> = None;
        let mut current = self.initial;
        let mut entered = true;
        let mut budget = RetryBudget {
            max_unauthorized: device.engine_config().max_unauthorized_retries,
            malformed_left: 0,
        };

        loop {
            let Some(state) = self.get(current) else {
                return Outcome::Failed(Fault::failed(format!("{}: unknown state {current}", self.name)));
            };

            if entered {
                debug!(client_id = %client_id, workflow = self.name, state = state.name, "Entering state");
                device.emit(WorkflowEvent::StateEntered {
                    client_id: client_id.to_string(),
                    workflow: self.name,
                    state: state.name,
                });
                budget.malformed_left = state
                    .retries
                    .unwrap_or(device.engine_config().malformed_retries);
            }

            match &state.step {
                Step::Success => return Outcome::Success,
                Step::Failure(fault) => return Outcome::Failed((*fault)(ctx)),
                _ => {}
            }

            match self.execute(state, ctx, device, &mut enumeration_context).await {
                StepResult::Next => {}
                StepResult::ChildFailed(fault) => return Outcome::Failed(fault),
                StepResult::Error(fault) => {
                    match recover(fault, state.on_error, &mut device.session, &mut budget) {
                        Resolution::Resume(target) => {
                            current = target;
                            entered = true;
                            continue;
                        }
                        Resolution::Retry => {
                            entered = false;
                            continue;
                        }
                        Resolution::Fail(fault) => return Outcome::Failed(fault),
                    }
                }
            }

            match state.guards.iter().find(|guard| (guard.when)(ctx)) {
                Some(guard) => {
                    debug!(
                        client_id = %client_id,
                        workflow = self.name,
                        state = state.name,
                        guard = guard.name,
                        target = guard.target,
                        "Transition"
                    );
                    current = guard.target;
                    entered = true;
                }
                None => return Outcome::Failed(Fault::NoGuardMatched(state.name.to_string())),
            }
        }
    }

    async fn execute(
        &self,
        state: &State<C>,
        ctx: &mut C,
        device: &mut Device,
        enumeration_context: &mut Option<String>,
    ) -> StepResult {
        let result = match &state.step {
            Step::Call { build, on_response } => match (*build)(ctx, &device.session) {
                Ok(call) => match device.call(&call).await {
                    Ok(envelope) => (*on_response)(ctx, &envelope),
                    Err(fault) => Err(fault),
                },
                Err(fault) => Err(fault),
            },
            Step::Enumerate(class) => match device.call(&WsmanCall::enumerate(class)).await {
                Ok(envelope) => match envelope.enumeration_context() {
                    Some(context) => {
                        *enumeration_context = Some(context.to_string());
                        Ok(())
                    }
                    None => Err(Fault::malformed(format!("{class} enumerate without EnumerationContext"))),
                },
                Err(fault) => Err(fault),
            },
            Step::Pull { class, store } => match enumeration_context.clone() {
                Some(context) => match device.call(&WsmanCall::pull(class, context)).await {
                    Ok(envelope) => (*store)(ctx, envelope.pull_items(class)),
                    Err(fault) => Err(fault),
                },
                None => Err(Fault::failed(format!("{class} pulled before enumerate"))),
            },
            Step::Task(task) => (*task)(ctx, device).await,
            Step::Child { workflow, run } => {
                return match (*run)(ctx, device).await {
                    Ok(()) => StepResult::Next,
                    Err(fault) => StepResult::ChildFailed(Fault::Child {
                        workflow: *workflow,
                        source: Box::new(fault),
                    }),
                };
            }
            Step::Delay(delay) => {
                let delay = (*delay)(device.engine_config());
                debug!(client_id = %device.client_id(), state = state.name, ?delay, "Waiting");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Step::Decide | Step::Success | Step::Failure(_) => Ok(()),
        };

        match result {
            Ok(()) => StepResult::Next,
            Err(fault) => StepResult::Error(fault),
        }
    }
}

/// Fail unless an AMT method returned zero
pub fn expect_zero(envelope: &Envelope, method: &str) -> Result<()> {
    match envelope.return_value(method) {
        Some(0) => Ok(()),
        Some(value) => Err(Fault::ReturnValue {
            method: method.to_string(),
            value,
        }),
        None => Err(Fault::malformed(format!("{method} response has no ReturnValue"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing;
    use futures::FutureExt;
    use serde_json::json;

    #[derive(Default)]
    struct Ctx {
        not_found: bool,
        hard_failure: bool,
        visited: Vec<&'static str>,
        counter: u32,
    }

    type S = State<Ctx>;

    fn visit_a<'a>(ctx: &'a mut Ctx, _device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.visited.push("A");
            Ok(())
        }
        .boxed()
    }

    fn visit_b<'a>(ctx: &'a mut Ctx, _device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.visited.push("B");
            Ok(())
        }
        .boxed()
    }

    fn count<'a>(ctx: &'a mut Ctx, _device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
        async move {
            ctx.counter += 1;
            Ok(())
        }
        .boxed()
    }

    fn failing_child<'a>(_ctx: &'a mut Ctx, _device: &'a mut Device) -> BoxFuture<'a, Result<()>> {
        async move { Err(Fault::failed("child broke")) }.boxed()
    }

    fn precedence_machine() -> Machine<Ctx> {
        Machine::new("precedence", "CHECK")
            .state(
                S::decide("CHECK")
                    .when("isNotFound", |c| c.not_found, "A")
                    .when("isHardFailure", |c| c.hard_failure, "B"),
            )
            .state(S::task("A", visit_a).then("DONE"))
            .state(S::task("B", visit_b).then("DONE"))
            .state(S::success("DONE"))
    }

    #[tokio::test]
    async fn test_first_declared_guard_wins() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut ctx = Ctx {
            not_found: true,
            hard_failure: true,
            ..Default::default()
        };
        let outcome = precedence_machine().run(&mut ctx, &mut device).await;
        assert!(outcome.is_success());
        assert_eq!(ctx.visited, vec!["A"]);
    }

    #[tokio::test]
    async fn test_no_guard_matched_fails() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut ctx = Ctx::default();
        let outcome = precedence_machine().run(&mut ctx, &mut device).await;
        assert!(matches!(outcome, Outcome::Failed(Fault::NoGuardMatched(ref s)) if s == "CHECK"));
        assert!(ctx.visited.is_empty());
    }

    #[tokio::test]
    async fn test_loop_and_failure_state() {
        let machine = Machine::new("loop", "COUNT")
            .state(S::task("COUNT", count).when("more", |c| c.counter < 3, "COUNT").then("STOP"))
            .state(S::failure("STOP", |c| Fault::failed(format!("stopped at {}", c.counter))));
        machine.validate().unwrap();

        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut ctx = Ctx::default();
        let outcome = machine.run(&mut ctx, &mut device).await;
        match outcome {
            Outcome::Failed(fault) => assert_eq!(fault.to_string(), "stopped at 3"),
            Outcome::Success => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_child_failure_is_wrapped() {
        let machine = Machine::new("parent", "CHILD")
            .state(S::child("CHILD", "network", failing_child).then("DONE"))
            .state(S::success("DONE"));

        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let outcome = machine.run(&mut Ctx::default(), &mut device).await;
        match outcome {
            Outcome::Failed(Fault::Child { workflow, source }) => {
                assert_eq!(workflow, "network");
                assert_eq!(source.to_string(), "child broke");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validate_catches_dangling_targets() {
        let machine = Machine::new("broken", "START").state(S::decide("START").then("NOWHERE"));
        assert!(machine.validate().is_err());

        let machine = Machine::new("stuck", "START").state(S::decide("START"));
        assert!(machine.validate().is_err());

        assert!(precedence_machine().validate().is_ok());
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (mut device, _pending, _rx) = testing::device("dev-1").await;
        let mut events = device.subscribe();
        let mut ctx = Ctx {
            not_found: true,
            ..Default::default()
        };
        precedence_machine().run(&mut ctx, &mut device).await;

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkflowEvent::StateEntered { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states, vec!["CHECK", "A", "DONE"]);
    }

    #[test]
    fn test_expect_zero() {
        let ok = Envelope::new(json!({"Body": {"Setup_OUTPUT": {"ReturnValue": 0}}}));
        assert!(expect_zero(&ok, "Setup").is_ok());

        let bad = Envelope::new(json!({"Body": {"Setup_OUTPUT": {"ReturnValue": "2"}}}));
        assert!(matches!(
            expect_zero(&bad, "Setup"),
            Err(Fault::ReturnValue { value: 2, .. })
        ));

        let missing = Envelope::new(json!({"Body": {}}));
        assert!(matches!(expect_zero(&missing, "Setup"), Err(Fault::Malformed(_))));
    }
}
