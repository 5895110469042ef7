use super::{keys, validate_tasks, worklist, Options, Task, TaskInstance, TaskStep};
use crate::config::TaskRules;
use crate::events::{names, EventBus, ListenerId, Payload, WeakEventBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

/// Where the orchestrator is in the life of the current step.
///
/// ELI5:
/// ┌──────────────────────── Step Lifecycle ──────────────────────────────┐
/// │  Idle ──start task──► StepDispatched (TASK_STEP_START published)     │
/// │                          ├─► AwaitingEvent          (awaitsEvent)    │
/// │                          ├─► AwaitingDelay          (nextStepDelay)  │
/// │                          └─► AwaitingExternalSignal (neither)        │
/// │                                   │                                  │
/// │                                   ▼                                  │
/// │                            StepResolved (TASK_STEP_COMPLETE)         │
/// │                                   │ advance_to_next_step_or_task()   │
/// │                    ┌──────────────┴───────────────┐                  │
/// │                    ▼                              ▼                  │
/// │              StepDispatched              TaskComplete ─► next task   │
/// │              (next step)                              or Idle        │
/// └──────────────────────────────────────────────────────────────────────┘
/// Worklist checks never wait : they resolve and branch on the spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepPhase {
    Idle,
    StepDispatched,
    AwaitingEvent,
    AwaitingDelay,
    AwaitingExternalSignal,
    StepResolved,
    TaskComplete,
}

/// Payload of `TASK_STEP_COMPLETE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub step: TaskStep,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

struct AwaitedEvent {
    event: String,
    listener: ListenerId,
    dispatch: u64,
}

struct PendingDelay {
    step_id: String,
    dispatch: u64,
    remaining_ms: f64,
}

enum Advance {
    Step(usize),
    FinishTask,
}

enum Route {
    Jump(String),
    Sequential,
}

/// Worklist jumps allowed to nest before branching gives way to sequential
/// advance. Checks that route to steps which never wait would otherwise
/// recurse without end.
const MAX_NESTED_ROUTES: u32 = 16;

struct State {
    rules: TaskRules,
    tasks: Vec<TaskInstance>,
    current: Option<TaskInstance>,
    current_index: Option<usize>,
    /// the dispatched copy of the current step, dynamic data included
    active_step: Option<TaskStep>,
    phase: StepPhase,
    // bumped every time a step is dispatched or abandoned; deferred callbacks
    // carry the value they were created under
    dispatch: u64,
    task_serial: u64,
    awaited: Option<AwaitedEvent>,
    delays: Vec<PendingDelay>,
    listeners: Vec<(&'static str, ListenerId)>,
    // worklist jumps currently on the stack
    routing_depth: u32,
}

/// Runs tasks step by step.
///
/// Cheap to clone : clones are handles onto the same state. Every operation
/// releases its borrow of that state before publishing, so listeners may call
/// straight back in (advance, jump, complete) while an event is dispatched.
#[derive(Clone)]
pub struct TaskManager {
    state: Rc<RefCell<State>>,
    bus: EventBus,
}

#[derive(Clone)]
struct WeakTaskManager {
    state: Weak<RefCell<State>>,
    bus: WeakEventBus,
}

impl WeakTaskManager {
    fn upgrade(&self) -> Option<TaskManager> {
        Some(TaskManager {
            state: self.state.upgrade()?,
            bus: self.bus.upgrade()?,
        })
    }
}

impl TaskManager {
    pub fn new(bus: EventBus, rules: TaskRules) -> Self {
        TaskManager {
            state: Rc::new(RefCell::new(State {
                rules,
                tasks: Vec::new(),
                current: None,
                current_index: None,
                active_step: None,
                phase: StepPhase::Idle,
                dispatch: 0,
                task_serial: 0,
                awaited: None,
                delays: Vec::new(),
                listeners: Vec::new(),
                routing_depth: 0,
            })),
            bus,
        }
    }

    fn downgrade(&self) -> WeakTaskManager {
        WeakTaskManager {
            state: Rc::downgrade(&self.state),
            bus: self.bus.downgrade(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ==================== Accessors ====================

    pub fn current_step(&self) -> Option<TaskStep> {
        self.state.borrow().active_step.clone()
    }

    pub fn current_task(&self) -> Option<TaskInstance> {
        self.state.borrow().current.clone()
    }

    pub fn phase(&self) -> StepPhase {
        self.state.borrow().phase
    }

    pub fn rules(&self) -> TaskRules {
        self.state.borrow().rules.clone()
    }

    fn is_dispatch_current(&self, dispatch: u64) -> bool {
        self.state.borrow().dispatch == dispatch
    }

    // ==================== Setup ====================

    /// Replaces the task list. Anything running is dropped without events.
    pub fn load_tasks(&self, tasks: Vec<Task>) {
        let check_action = self.state.borrow().rules.check_remaining_action.clone();
        for issue in validate_tasks(&tasks, &check_action) {
            warn!(%issue, "task configuration");
        }

        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        self.invalidate(state);
        state.tasks = tasks.into_iter().map(TaskInstance::new).collect();
        state.current = None;
        state.current_index = None;
        state.active_step = None;
        state.phase = StepPhase::Idle;
        info!(count = state.tasks.len(), "tasks loaded");
    }

    /// Listens for `TASK_STEP_ACTION_COMPLETE` from the scene. Calling it
    /// twice keeps a single listener.
    pub fn setup_event_listeners(&self) {
        if self
            .state
            .borrow()
            .listeners
            .iter()
            .any(|(event, _)| *event == names::TASK_STEP_ACTION_COMPLETE)
        {
            return;
        }
        let weak = self.downgrade();
        let id = self
            .bus
            .subscribe(names::TASK_STEP_ACTION_COMPLETE, move |payload| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_action_complete_signal(payload);
                }
            });
        self.state
            .borrow_mut()
            .listeners
            .push((names::TASK_STEP_ACTION_COMPLETE, id));
    }

    /// Removes every listener this manager put on the bus and drops pending
    /// waits. Task state is left as is.
    pub fn teardown(&self) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        self.invalidate(state);
        for (event, id) in state.listeners.drain(..) {
            self.bus.unsubscribe(event, id);
        }
    }

    /// Forget the current dispatch : deferred callbacks created under it
    /// become stale.
    fn invalidate(&self, state: &mut State) {
        if let Some(awaited) = state.awaited.take() {
            self.bus.unsubscribe(&awaited.event, awaited.listener);
        }
        state.delays.clear();
        state.dispatch += 1;
    }

    // ==================== Tasks ====================

    /// Starts the first task after the current one that has steps. Refuses
    /// while the current task is still mid-way.
    pub fn start_next_task(&self) {
        let next = {
            let state = self.state.borrow();
            if let Some(task) = &state.current {
                if !task.finished && !task.is_at_terminal_step() {
                    warn!(
                        task_id = task.id(),
                        step = task.current_step_index,
                        "current task is not finished, not starting the next one"
                    );
                    return;
                }
            }
            let from = state.current_index.map_or(0, |index| index + 1);
            state
                .tasks
                .iter()
                .enumerate()
                .skip(from)
                .find(|(_, task)| !task.steps().is_empty())
                .map(|(index, _)| index)
        };

        match next {
            Some(index) => self.start_task_by_index(index),
            None => {
                {
                    let mut guard = self.state.borrow_mut();
                    let state = &mut *guard;
                    self.invalidate(state);
                    state.current = None;
                    state.active_step = None;
                    state.phase = StepPhase::Idle;
                }
                info!("all tasks complete");
                self.bus.publish(names::ALL_TASKS_COMPLETE, &Payload::Null);
            }
        }
    }

    pub fn start_task_by_id(&self, task_id: &str) {
        let index = self
            .state
            .borrow()
            .tasks
            .iter()
            .position(|task| task.id() == task_id);
        match index {
            Some(index) => self.start_task_by_index(index),
            None => error!(task_id, "no task with this id"),
        }
    }

    fn start_task_by_index(&self, index: usize) {
        let (instance, serial) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(template) = state.tasks.get(index) else {
                error!(index, "task index out of range");
                return;
            };
            // fresh copy : runtime fields never touch the template
            let instance = TaskInstance::new(template.task.clone());
            self.invalidate(state);
            state.current_index = Some(index);
            state.current = Some(instance.clone());
            state.active_step = None;
            state.phase = StepPhase::Idle;
            state.task_serial += 1;
            (instance, state.task_serial)
        };

        info!(task_id = instance.id(), name = %instance.task.name, "starting task");
        self.bus.emit(names::TASK_START, &instance);

        if self.state.borrow().task_serial != serial {
            debug!(task_id = instance.id(), "task replaced while its start was announced");
            return;
        }
        if instance.steps().is_empty() {
            warn!(task_id = instance.id(), "task has no steps");
            self.complete_task();
        } else {
            self.proceed_to_step(0);
        }
    }

    fn complete_task(&self) {
        let snapshot = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            self.invalidate(state);
            let Some(task) = state.current.as_mut() else {
                return;
            };
            task.finished = true;
            let snapshot = task.clone();
            state.active_step = None;
            state.phase = StepPhase::TaskComplete;
            snapshot
        };

        info!(task_id = snapshot.id(), name = %snapshot.task.name, "task complete");
        self.bus.emit(names::TASK_COMPLETE, &snapshot);
        self.start_next_task();
    }

    // ==================== Steps ====================

    fn proceed_to_step(&self, index: usize) {
        let (step, dispatch) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            self.invalidate(state);
            let Some(task) = state.current.as_mut() else {
                error!("cannot proceed to a step without a current task");
                return;
            };
            let Some(mut step) = task.steps().get(index).cloned() else {
                error!(task_id = task.id(), index, "step index out of range");
                return;
            };
            if let Some(data) = task.dynamic_step_data.remove(&step.id) {
                debug!(step_id = %step.id, keys = ?data.keys().collect::<Vec<_>>(), "injecting step data");
                step.inject(data);
            }
            task.current_step_index = index;
            state.active_step = Some(step.clone());
            state.phase = StepPhase::StepDispatched;
            (step, state.dispatch)
        };

        info!(step_id = %step.id, action = %step.action, "step started");
        self.bus.emit(names::TASK_STEP_START, &step);

        // a listener may already have resolved or replaced this step
        if !self.is_dispatch_current(dispatch) || self.phase() != StepPhase::StepDispatched {
            debug!(step_id = %step.id, "step moved on while it was announced");
            return;
        }

        let check_action = self.state.borrow().rules.check_remaining_action.clone();
        if let Some(event) = step.awaits_event.as_deref() {
            self.await_event(&step, event, dispatch);
        } else if step.action == check_action {
            self.check_remaining_items(&step);
        } else if let Some(delay) = step.next_step_delay {
            let mut state = self.state.borrow_mut();
            state.delays.push(PendingDelay {
                step_id: step.id.clone(),
                dispatch,
                remaining_ms: delay.max(0.0),
            });
            state.phase = StepPhase::AwaitingDelay;
            debug!(step_id = %step.id, delay, "step completes after delay");
        } else {
            self.state.borrow_mut().phase = StepPhase::AwaitingExternalSignal;
            debug!(step_id = %step.id, "waiting for the scene to complete the step");
        }
    }

    fn await_event(&self, step: &TaskStep, event: &str, dispatch: u64) {
        let weak = self.downgrade();
        let listener = self.bus.subscribe(event, move |payload| {
            if let Some(manager) = weak.upgrade() {
                manager.on_awaited_event(dispatch, payload);
            }
        });
        let mut state = self.state.borrow_mut();
        state.awaited = Some(AwaitedEvent {
            event: event.to_string(),
            listener,
            dispatch,
        });
        state.phase = StepPhase::AwaitingEvent;
        debug!(step_id = %step.id, event, "waiting for event");
    }

    fn on_awaited_event(&self, dispatch: u64, payload: &Payload) {
        let step_id = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            // already resolved, or left for another step
            if state.awaited.as_ref().map(|awaited| awaited.dispatch) != Some(dispatch) {
                return;
            }
            let Some(step) = state.active_step.as_ref() else {
                return;
            };
            if let Some(check) = &step.event_data_check {
                if !payload_matches(check, payload) {
                    debug!(step_id = %step.id, "event data did not match, still waiting");
                    return;
                }
            }
            let step_id = step.id.clone();
            if let Some(awaited) = state.awaited.take() {
                self.bus.unsubscribe(&awaited.event, awaited.listener);
            }

            // hand the event data to the next step in sequence
            if let Some(task) = state.current.as_mut() {
                let next_id = task
                    .steps()
                    .get(task.current_step_index + 1)
                    .map(|next| next.id.clone());
                if let Some(next_id) = next_id {
                    let mut data = Options::new();
                    data.insert(keys::SELECTED_COLOR_OPTION.to_string(), payload.clone());
                    data.insert(keys::COMPLETED_ITEM.to_string(), payload.clone());
                    task.stage(&next_id, data);
                }
            }
            step_id
        };

        self.on_step_action_complete(&step_id, Some(payload.clone()));
    }

    /// Resolves the current step. Signals for any other step, or for a step
    /// that already resolved, are logged and dropped. Does not advance :
    /// whoever handles `TASK_STEP_COMPLETE` calls
    /// `advance_to_next_step_or_task` when it is ready.
    pub fn on_step_action_complete(&self, step_id: &str, data: Option<Value>) {
        let step = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(active) = state.active_step.as_ref() else {
                warn!(step_id, "step completion without a current step, ignoring");
                return;
            };
            if active.id != step_id {
                warn!(step_id, current = %active.id, "completion for a step that is not current, ignoring");
                return;
            }
            if state.phase == StepPhase::StepResolved {
                warn!(step_id, "step already resolved, ignoring");
                return;
            }
            let step = active.clone();

            if step.action == state.rules.coloring_action {
                if let (Some(picked), Some(task)) = (
                    step.options.get(keys::SELECTED_COLOR_OPTION),
                    state.current.as_mut(),
                ) {
                    let list = step
                        .item_list_name
                        .as_deref()
                        .unwrap_or(&state.rules.default_item_list);
                    if task.record_completed(list, picked.clone(), &state.rules.item_key) {
                        debug!(step_id, list, "item completed");
                    }
                }
            }

            if let Some(awaited) = state.awaited.take() {
                self.bus.unsubscribe(&awaited.event, awaited.listener);
            }
            state.delays.clear();
            state.phase = StepPhase::StepResolved;
            step
        };

        info!(step_id, "step complete");
        self.bus
            .emit(names::TASK_STEP_COMPLETE, &StepCompletion { step, data });
    }

    pub fn advance_to_next_step_or_task(&self) {
        let next = {
            let state = self.state.borrow();
            let Some(task) = state.current.as_ref() else {
                error!("cannot advance without a current task");
                return;
            };
            if task.finished {
                warn!(task_id = task.id(), "task already finished, ignoring advance");
                return;
            }
            let next_index = task.current_step_index + 1;
            match task.current_template() {
                Some(step) if step.is_end_of_task => Advance::FinishTask,
                _ if next_index < task.steps().len() => Advance::Step(next_index),
                _ => Advance::FinishTask,
            }
        };

        match next {
            Advance::Step(index) => self.proceed_to_step(index),
            Advance::FinishTask => self.complete_task(),
        }
    }

    /// Unknown ids degrade to a plain advance.
    pub fn jump_to_step(&self, step_id: &str) {
        let target = {
            let state = self.state.borrow();
            let Some(task) = state.current.as_ref() else {
                error!(step_id, "cannot jump without a current task");
                return;
            };
            task.task.step_index(step_id)
        };

        match target {
            Some(index) => self.proceed_to_step(index),
            None => {
                error!(step_id, "no such step in the current task, advancing instead");
                self.advance_to_next_step_or_task();
            }
        }
    }

    fn check_remaining_items(&self, step: &TaskStep) {
        let route = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            state.phase = StepPhase::StepResolved;
            let route = match route_worklist(state, step) {
                Route::Jump(target) if state.routing_depth >= MAX_NESTED_ROUTES => {
                    error!(
                        step_id = %step.id,
                        jump_to = %target,
                        depth = state.routing_depth,
                        "worklist keeps branching without waiting, advancing instead"
                    );
                    Route::Sequential
                }
                route => route,
            };
            state.routing_depth += 1;
            route
        };

        match route {
            Route::Jump(target) => self.jump_to_step(&target),
            Route::Sequential => self.advance_to_next_step_or_task(),
        }

        let mut state = self.state.borrow_mut();
        state.routing_depth = state.routing_depth.saturating_sub(1);
    }

    /// Advance pending `nextStepDelay` timers by `elapsed_ms`.
    pub fn tick(&self, elapsed_ms: f64) {
        let due: Vec<PendingDelay> = {
            let mut state = self.state.borrow_mut();
            if state.delays.is_empty() {
                return;
            }
            for delay in state.delays.iter_mut() {
                delay.remaining_ms -= elapsed_ms;
            }
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delays)
                .into_iter()
                .partition(|delay| delay.remaining_ms <= 0.0);
            state.delays = pending;
            due
        };

        for delay in due {
            if !self.is_dispatch_current(delay.dispatch) {
                debug!(step_id = %delay.step_id, "dropping timer of a step that is no longer current");
                continue;
            }
            debug!(step_id = %delay.step_id, "step delay elapsed");
            self.on_step_action_complete(&delay.step_id, None);
        }
    }

    /// `TASK_STEP_ACTION_COMPLETE` : `{ stepId?, action, options?, error? }`
    fn on_action_complete_signal(&self, payload: &Payload) {
        let step_id = payload.get("stepId").and_then(Value::as_str);
        let action = payload.get("action").and_then(Value::as_str);
        let Some(current) = self.current_step() else {
            warn!(?step_id, ?action, "action complete signal without a current step, ignoring");
            return;
        };
        let matches = match step_id {
            Some(step_id) => step_id == current.id,
            None => action == Some(current.action.as_str()),
        };
        if !matches {
            warn!(
                ?step_id,
                ?action,
                current = %current.id,
                "action complete signal for another step, ignoring"
            );
            return;
        }
        if let Some(err) = payload.get("error") {
            warn!(step_id = %current.id, error = %err, "scene reported a problem with the step");
        }
        let data = payload
            .get("options")
            .cloned()
            .unwrap_or_else(|| payload.clone());
        self.on_step_action_complete(&current.id, Some(data));
    }
}

/// Every key/value of `check` must be present in `payload`. Numbers compare
/// by value, so `1` matches `1.0`.
fn payload_matches(check: &Options, payload: &Payload) -> bool {
    check.iter().all(|(key, expected)| match (payload.get(key), expected) {
        (Some(Value::Number(actual)), Value::Number(expected)) => {
            actual == expected || actual.as_f64() == expected.as_f64()
        }
        (actual, expected) => actual == Some(expected),
    })
}

fn route_worklist(state: &mut State, step: &TaskStep) -> Route {
    let (Some(list), Some(source_id)) = (
        step.item_list_name.as_deref(),
        step.source_step_id_for_itemlist.as_deref(),
    ) else {
        error!(step_id = %step.id, "worklist check needs itemListName and sourceStepIdForItemlist");
        return Route::Sequential;
    };

    // read the list from the template : dispatched copies may carry a
    // filtered list
    let total = state
        .current_index
        .and_then(|index| state.tasks.get(index))
        .and_then(|template| template.task.step(source_id))
        .and_then(|source| source.options.get(list))
        .and_then(Value::as_array)
        .cloned();
    let Some(total) = total else {
        error!(step_id = %step.id, source_id, list, "worklist source step or list not found");
        return Route::Sequential;
    };
    let Some(task) = state.current.as_mut() else {
        return Route::Sequential;
    };

    if let Some(item) = &step.completed_item {
        task.record_completed(list, item.clone(), &state.rules.item_key);
    }
    let remaining = worklist::remaining(&total, task.completed(list), &state.rules.item_key);
    info!(
        step_id = %step.id,
        list,
        total = total.len(),
        completed = task.completed(list).len(),
        remaining = remaining.len(),
        "checked remaining items"
    );

    if remaining.is_empty() {
        return match &step.next_step_if_no_items_remain {
            Some(target) if *target == step.id => {
                error!(step_id = %step.id, "worklist check routes to itself, advancing instead");
                Route::Sequential
            }
            Some(target) => Route::Jump(target.clone()),
            None => Route::Sequential,
        };
    }
    match &step.next_step_if_items_remain {
        Some(target) if *target == step.id => {
            error!(step_id = %step.id, "worklist check routes to itself, advancing instead");
            Route::Sequential
        }
        Some(target) => {
            let remaining = Value::Array(remaining);
            let mut data = Options::new();
            data.insert(list.to_string(), remaining.clone());
            data.insert(keys::REMAINING.to_string(), remaining);
            task.stage(target, data);
            Route::Jump(target.clone())
        }
        None => Route::Sequential,
    }
}
