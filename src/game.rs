use crate::browser;
use crate::config::GameConfig;
use crate::engine::{Game, Spawner};
use crate::events::{names, EventBus, ListenerId, Payload};
use crate::scene::{SceneDirector, Stage};
use crate::task::{TaskDocument, TaskManager};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{error, info, warn};

/// TABLE
/// ┌───────────────────── Game Architecture Overview ────────────────────────┐
/// │                                                                         │
/// │                              Update Flow                                │
/// │                                                                         │
/// │    ┌─────────────┐          ┌──────────────┐         ┌─────────────┐    │
/// │    │  engine.rs  │  update  │   game.rs    │  tick   │ TaskManager │    │
/// │    │  GameLoop   ├─────────►│ ColoringGame ├────────►│  delays     │    │
/// │    │  FrameClock │          │ GameManager  │         │             │    │
/// │    └─────────────┘          └──────────────┘         └──────┬──────┘    │
/// │                                                             │ events    │
/// │                                                      ┌──────┴──────┐    │
/// │                                                      │ SceneDirector│   │
/// │                                                      │  → Stage (JS)│   │
/// │                                                      └─────────────┘    │
/// ├──────────────────────── Lifecycle ──────────────────────────────────────┤
/// │                                                                         │
/// │  Splash ─► Loading ─► Ready ─► Playing ◄──► Paused                      │
/// │                         ▲        │  ▲                                   │
/// │                       Menu       ▼  │                                   │
/// │                            TaskTransition ─► End (ALL_TASKS_COMPLETE)   │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GameState {
    Splash,
    Loading,
    Menu,
    Ready,
    Playing,
    Paused,
    TaskTransition,
    End,
}

#[derive(Serialize)]
struct StateChange {
    from: GameState,
    to: GameState,
}

/// Owns the bus, the task manager and the scene, and moves the game through
/// its `GameState`s. Clones share the same game.
#[derive(Clone)]
pub struct GameManager {
    inner: Rc<Shared>,
}

struct Shared {
    config: GameConfig,
    state: Cell<GameState>,
    tasks: TaskManager,
    stage: Rc<dyn Stage>,
    spawner: Rc<dyn Spawner>,
    director: RefCell<Option<SceneDirector>>,
    listeners: RefCell<Vec<(&'static str, ListenerId)>>,
}

impl GameManager {
    pub fn new(config: GameConfig, stage: Rc<dyn Stage>, spawner: Rc<dyn Spawner>) -> Self {
        let tasks = TaskManager::new(EventBus::new(), config.rules.clone());
        tasks.setup_event_listeners();
        let manager = GameManager {
            inner: Rc::new(Shared {
                config,
                state: Cell::new(GameState::Splash),
                tasks,
                stage,
                spawner,
                director: RefCell::new(None),
                listeners: RefCell::new(Vec::new()),
            }),
        };

        let handlers: [(&'static str, fn(&GameManager)); 3] = [
            (names::TASK_START, GameManager::on_task_start),
            (names::TASK_COMPLETE, GameManager::on_task_complete),
            (names::ALL_TASKS_COMPLETE, GameManager::on_all_tasks_complete),
        ];
        for (event, handler) in handlers {
            let weak: Weak<Shared> = Rc::downgrade(&manager.inner);
            let id = manager.bus().subscribe(event, move |_| {
                if let Some(inner) = weak.upgrade() {
                    handler(&GameManager { inner });
                }
            });
            manager.inner.listeners.borrow_mut().push((event, id));
        }
        manager
    }

    // ==================== Accessors ====================

    pub fn state(&self) -> GameState {
        self.inner.state.get()
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn bus(&self) -> &EventBus {
        self.inner.tasks.bus()
    }

    pub fn config(&self) -> &GameConfig {
        &self.inner.config
    }

    /// Publish on the game bus on behalf of the page.
    pub fn emit(&self, event: &str, payload: &Payload) {
        self.bus().publish(event, payload);
    }

    fn set_state(&self, next: GameState) {
        let from = self.inner.state.replace(next);
        if from == next {
            return;
        }
        info!(?from, to = ?next, "game state changed");
        self.bus()
            .emit(names::GAME_STATE_CHANGED, &StateChange { from, to: next });
    }

    // ==================== Lifecycle ====================

    pub fn begin_loading(&self) {
        self.set_state(GameState::Loading);
        self.bus().publish(names::GAME_LOADING_START, &Payload::Null);
    }

    /// Loads the tasks (none when the document could not be had), enters
    /// the scene and becomes `Ready`.
    pub fn finish_loading(&self, document: Option<TaskDocument>) {
        let tasks = document.map(|document| document.tasks).unwrap_or_default();
        if tasks.is_empty() {
            warn!("no tasks loaded, the game will end as soon as it starts");
        }
        self.inner.tasks.load_tasks(tasks);

        if self.inner.director.borrow().is_none() {
            let director = SceneDirector::enter(
                self.inner.tasks.clone(),
                self.inner.stage.clone(),
                self.inner.spawner.clone(),
            );
            *self.inner.director.borrow_mut() = Some(director);
        }

        self.set_state(GameState::Ready);
        self.bus().publish(names::GAME_READY, &Payload::Null);
    }

    /// Ready → Menu, while the page shows its start button.
    pub fn show_menu(&self) {
        match self.state() {
            GameState::Ready => self.set_state(GameState::Menu),
            state => warn!(?state, "menu can only be shown once ready"),
        }
    }

    pub fn start_game(&self) {
        match self.state() {
            GameState::Ready | GameState::Menu => {
                self.set_state(GameState::Playing);
                self.inner.stage.play_music(&self.inner.config.background_music);
                self.bus().publish(names::GAME_START, &Payload::Null);
                self.inner.tasks.start_next_task();
            }
            state => warn!(?state, "game cannot start from this state"),
        }
    }

    pub fn pause_game(&self) {
        match self.state() {
            GameState::Playing => {
                self.set_state(GameState::Paused);
                self.inner.stage.pause_music();
                self.bus().publish(names::GAME_PAUSED, &Payload::Null);
            }
            state => warn!(?state, "only a running game can be paused"),
        }
    }

    pub fn resume_game(&self) {
        match self.state() {
            GameState::Paused => {
                self.set_state(GameState::Playing);
                self.inner.stage.resume_music();
                self.bus().publish(names::GAME_RESUMED, &Payload::Null);
            }
            state => warn!(?state, "only a paused game can be resumed"),
        }
    }

    /// One fixed step. Step delays only run while the game runs.
    pub fn update(&self, delta_ms: f64) {
        if matches!(self.state(), GameState::Playing | GameState::TaskTransition) {
            self.inner.tasks.tick(delta_ms);
        }
    }

    /// Leaves the scene and detaches everything from the bus.
    pub fn shutdown(&self) {
        if let Some(director) = self.inner.director.borrow_mut().take() {
            director.on_exit();
        }
        self.inner.tasks.teardown();
        for (event, id) in self.inner.listeners.borrow_mut().drain(..) {
            self.bus().unsubscribe(event, id);
        }
    }

    fn on_task_start(&self) {
        if self.state() == GameState::TaskTransition {
            self.set_state(GameState::Playing);
        }
    }

    fn on_task_complete(&self) {
        if self.state() == GameState::Playing {
            self.set_state(GameState::TaskTransition);
        }
    }

    fn on_all_tasks_complete(&self) {
        self.set_state(GameState::End);
    }
}

/// `Game` run by the loop : fetches the task document, then forwards
/// fixed steps to the `GameManager`.
pub enum ColoringGame {
    /// waiting for the task document
    Loading(GameManager),
    Loaded(GameManager),
}

impl ColoringGame {
    pub fn new(manager: GameManager) -> Self {
        ColoringGame::Loading(manager)
    }

    async fn load_document(url: &str) -> Result<TaskDocument> {
        let value: Value = browser::fetch_json(url)
            .await
            .with_context(|| format!("Failed to load tasks from : {}", url))?;
        Ok(TaskDocument::from_value(value)?)
    }
}

#[async_trait(?Send)]
impl Game for ColoringGame {
    async fn initialize(&self) -> Result<Box<dyn Game>> {
        match self {
            ColoringGame::Loading(manager) => {
                manager.begin_loading();
                let url = manager.config().tasks_url.clone();
                let document = match Self::load_document(&url).await {
                    Ok(document) => Some(document),
                    Err(err) => {
                        error!("could not load tasks : {err:#}");
                        None
                    }
                };
                manager.finish_loading(document);
                Ok(Box::new(ColoringGame::Loaded(manager.clone())))
            }
            ColoringGame::Loaded(_) => Err(anyhow!("Game is already initialized")),
        }
    }

    fn update(&mut self, delta_ms: f64) {
        if let ColoringGame::Loaded(manager) = self {
            manager.update(delta_ms);
        }
    }
}
