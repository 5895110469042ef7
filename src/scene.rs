use crate::engine::Spawner;
use crate::events::{names, EventBus, ListenerId, Payload};
use crate::task::manager::StepCompletion;
use crate::task::{keys, ColorOption, TaskManager, TaskStep};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

/// Step actions the scene knows how to play.
pub mod actions {
    pub const RABBIT_SPEECH: &str = "RABBIT_SPEECH";
    pub const SHOW_PALETTE: &str = "SHOW_PALETTE";
    pub const SHOW_DRAWING_BOARD_FOR_COLORING: &str = "SHOW_DRAWING_BOARD_FOR_COLORING";
    pub const ALL_COLORS_DONE_FOCUS_POND: &str = "ALL_COLORS_DONE_FOCUS_POND";
    pub const COLORING_COMPLETE: &str = "COLORING_COMPLETE";
}

// stock clips and voice lines
const SELECT_COLOR_VOICE: &str = "sfx_select_color";
const CONGRATS_ANIMATION: &str = "congrats_anim";
const CONGRATS_VOICE: &str = "sfx_congrats";
const CELEBRATE_ANIMATION: &str = "celebrate_anim";
const DEFAULT_FROG_COUNT: u32 = 3;

/// What the scene can do on screen and through the speakers. Every future
/// resolves when the thing it started has finished playing.
#[async_trait(?Send)]
pub trait Stage {
    fn show_rabbit(&self);
    fn has_animation(&self, name: &str) -> bool;
    /// looped clips resolve once started
    async fn play_animation(&self, name: &str, looped: bool);
    async fn say(&self, voice: &str);
    async fn play_sound(&self, sound: &str);
    async fn show_palette(&self, colors: &[ColorOption]);
    async fn show_drawing_board(&self, color_name: &str, target_word: &str);
    async fn hide_drawing_board(&self);
    async fn focus_pond(&self);
    async fn spawn_frogs(&self, count: u32);
    fn play_music(&self, name: &str);
    fn pause_music(&self);
    fn resume_music(&self);
}

/// `TASK_STEP_ACTION_COMPLETE` payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionComplete {
    step_id: String,
    action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ActionComplete {
    fn ok(step: &TaskStep) -> Self {
        ActionComplete {
            step_id: step.id.clone(),
            action: step.action.clone(),
            error: None,
        }
    }

    fn failed(step: &TaskStep, error: &str) -> Self {
        ActionComplete {
            error: Some(error.to_string()),
            ..Self::ok(step)
        }
    }
}

/// Plays task steps on the `Stage` and reports back on the bus.
///
/// TABLE:
/// ┌──────────────────────┬──────────────────────────────────────────────┐
/// │ Event                │ Reaction                                     │
/// ├──────────────────────┼──────────────────────────────────────────────┤
/// │ TASK_STEP_START      │ play the step's action, then signal          │
/// │                      │ TASK_STEP_ACTION_COMPLETE (unless the step   │
/// │                      │ waits for an event)                          │
/// │ TASK_STEP_COMPLETE   │ congratulate after a finished coloring, then │
/// │                      │ advance the task                             │
/// │ TASK_COMPLETE        │ celebrate                                    │
/// │ PALETTE_COLOR_SELECTED │ log only, the task manager consumes it     │
/// └──────────────────────┴──────────────────────────────────────────────┘
pub struct SceneDirector {
    inner: Rc<Director>,
}

struct Director {
    stage: Rc<dyn Stage>,
    tasks: TaskManager,
    spawner: Rc<dyn Spawner>,
    listeners: RefCell<Vec<(&'static str, ListenerId)>>,
}

impl SceneDirector {
    /// Subscribes to the task events on the manager's bus.
    pub fn enter(tasks: TaskManager, stage: Rc<dyn Stage>, spawner: Rc<dyn Spawner>) -> Self {
        let inner = Rc::new(Director {
            stage,
            tasks,
            spawner,
            listeners: RefCell::new(Vec::new()),
        });
        let bus = inner.tasks.bus().clone();

        let handlers: [(&'static str, fn(&Rc<Director>, &Payload)); 4] = [
            (names::TASK_STEP_START, Director::on_step_start),
            (names::TASK_STEP_COMPLETE, Director::on_step_complete),
            (names::TASK_COMPLETE, Director::on_task_complete),
            (names::PALETTE_COLOR_SELECTED, Director::on_color_selected),
        ];
        for (event, handler) in handlers {
            let weak: Weak<Director> = Rc::downgrade(&inner);
            let id = bus.subscribe(event, move |payload| {
                if let Some(director) = weak.upgrade() {
                    handler(&director, payload);
                }
            });
            inner.listeners.borrow_mut().push((event, id));
        }
        info!("scene entered");

        SceneDirector { inner }
    }

    /// Removes the director's listeners. Futures already running still
    /// finish and their signals are ignored if the step moved on.
    pub fn on_exit(&self) {
        let bus = self.inner.tasks.bus();
        for (event, id) in self.inner.listeners.borrow_mut().drain(..) {
            bus.unsubscribe(event, id);
        }
        info!("scene exited");
    }
}

impl Director {
    fn bus(&self) -> &EventBus {
        self.tasks.bus()
    }

    fn signal(bus: &EventBus, complete: ActionComplete) {
        bus.emit(names::TASK_STEP_ACTION_COMPLETE, &complete);
    }

    fn on_step_start(self: &Rc<Self>, payload: &Payload) {
        let step: TaskStep = match serde_json::from_value(payload.clone()) {
            Ok(step) => step,
            Err(err) => {
                error!(%err, "unreadable step start payload");
                return;
            }
        };
        // worklist checks are resolved by the task manager itself
        if step.action == self.tasks.rules().check_remaining_action {
            return;
        }
        debug!(step_id = %step.id, action = %step.action, "playing step");

        match step.action.as_str() {
            actions::RABBIT_SPEECH => self.rabbit_speech(step),
            actions::SHOW_PALETTE => self.show_palette(step),
            actions::SHOW_DRAWING_BOARD_FOR_COLORING => self.show_drawing_board(step),
            actions::ALL_COLORS_DONE_FOCUS_POND => self.focus_pond(step),
            other => {
                warn!(step_id = %step.id, action = other, "no scene handler for action");
                if !step.waits_for_event() && step.next_step_delay.is_none() {
                    Self::signal(self.bus(), ActionComplete::failed(&step, "no handler"));
                }
            }
        }
    }

    fn rabbit_speech(&self, step: TaskStep) {
        self.stage.show_rabbit();
        let animation = step
            .rabbit_animation()
            .filter(|name| self.stage.has_animation(name))
            .map(str::to_string);
        let voice = step.voice_over().map(str::to_string);

        if animation.is_none() && voice.is_none() {
            Self::signal(self.bus(), ActionComplete::ok(&step));
            return;
        }
        let (stage, bus) = (self.stage.clone(), self.bus().clone());
        self.spawner.spawn(Box::pin(async move {
            if let Some(animation) = animation {
                stage.play_animation(&animation, false).await;
            }
            if let Some(voice) = voice {
                stage.say(&voice).await;
            }
            Self::signal(&bus, ActionComplete::ok(&step));
        }));
    }

    fn show_palette(&self, step: TaskStep) {
        let voice = step.voice_over().unwrap_or(SELECT_COLOR_VOICE).to_string();
        let colors = step.colors();
        let stage = self.stage.clone();
        // completion comes from the awaited palette event
        self.spawner.spawn(Box::pin(async move {
            futures::join!(stage.say(&voice), stage.show_palette(&colors));
        }));
    }

    fn show_drawing_board(&self, step: TaskStep) {
        let picked = step.options.get(keys::SELECTED_COLOR_OPTION);
        let field = |name: &str| {
            picked
                .and_then(|option| option.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let (Some(color_name), Some(target_word)) = (field("colorName"), field("targetWord")) else {
            error!(step_id = %step.id, "drawing board needs a selected color option");
            Self::signal(self.bus(), ActionComplete::failed(&step, "missing color option"));
            return;
        };
        let voice = step.voice_over().map(str::to_string);
        let stage = self.stage.clone();
        // finishing the drawing is signalled by the page
        self.spawner.spawn(Box::pin(async move {
            stage.show_drawing_board(&color_name, &target_word).await;
            if let Some(voice) = voice {
                stage.say(&voice).await;
            }
        }));
    }

    fn focus_pond(&self, step: TaskStep) {
        let voice = step.voice_over().map(str::to_string);
        let count = step.count().unwrap_or(DEFAULT_FROG_COUNT);
        let (stage, bus) = (self.stage.clone(), self.bus().clone());
        self.spawner.spawn(Box::pin(async move {
            stage.hide_drawing_board().await;
            match voice {
                Some(voice) => {
                    futures::join!(stage.say(&voice), stage.focus_pond());
                }
                None => stage.focus_pond().await,
            }
            if count > 0 {
                stage.spawn_frogs(count).await;
            }
            Self::signal(&bus, ActionComplete::ok(&step));
        }));
    }

    fn on_step_complete(self: &Rc<Self>, payload: &Payload) {
        let completion: StepCompletion = match serde_json::from_value(payload.clone()) {
            Ok(completion) => completion,
            Err(err) => {
                error!(%err, "unreadable step complete payload");
                return;
            }
        };
        let colored = completion.step.action == actions::COLORING_COMPLETE
            || completion.step.action == self.tasks.rules().coloring_action;
        let failed = completion
            .data
            .as_ref()
            .is_some_and(|data| data.get("error").is_some());
        if !colored || failed {
            self.tasks.advance_to_next_step_or_task();
            return;
        }

        let sound = completion.data.as_ref().and_then(color_name_sound);
        let (stage, tasks) = (self.stage.clone(), self.tasks.clone());
        self.spawner.spawn(Box::pin(async move {
            stage.show_rabbit();
            stage.play_animation(CONGRATS_ANIMATION, false).await;
            stage.say(CONGRATS_VOICE).await;
            if let Some(sound) = sound {
                stage.play_sound(&sound).await;
            }
            tasks.advance_to_next_step_or_task();
        }));
    }

    fn on_task_complete(self: &Rc<Self>, payload: &Payload) {
        let task_id = payload.get("id").and_then(Value::as_str).unwrap_or_default();
        info!(task_id, "celebrating");
        let stage = self.stage.clone();
        self.spawner.spawn(Box::pin(async move {
            stage.play_animation(CELEBRATE_ANIMATION, true).await;
        }));
    }

    fn on_color_selected(self: &Rc<Self>, payload: &Payload) {
        let color = payload.get("colorName").and_then(Value::as_str);
        debug!(?color, "palette color selected");
    }
}

/// `colorNameSound`, either at the top of the completion data or under
/// `options`
fn color_name_sound(data: &Value) -> Option<String> {
    data.get("colorNameSound")
        .or_else(|| data.pointer("/options/colorNameSound"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
