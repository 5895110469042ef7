// ==================== Imports ====================
use once_cell::unsync::OnceCell;
use serde_json::Value;
use std::rc::Rc;
use tracing::{error, info};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsValue;

pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod game;
pub mod scene;
pub mod task;

use browser::{BrowserStage, JsStage};
use config::GameConfig;
use engine::{BrowserSpawner, GameLoop};
use game::{ColoringGame, GameManager};

// ==================== State ====================
thread_local! {
    // one game per page
    static GAME: OnceCell<GameManager> = OnceCell::new();
}

fn with_game<R>(f: impl FnOnce(&GameManager) -> R) -> Result<R, JsValue> {
    GAME.with(|game| game.get().map(f))
        .ok_or_else(|| JsValue::from_str("game is not running, call main_js first"))
}

// ==================== Main Functions ====================
/// Main entry for Webassembly module
/// - reads the config handed over by the page
/// - routes logs to the console
/// - starts loading tasks and the game loop
#[wasm_bindgen]
pub fn main_js(stage: JsStage, config: JsValue) -> Result<(), JsValue> {
    // setup better panic messages for debugging
    console_error_panic_hook::set_once();

    let config = GameConfig::from_js(config).map_err(|err| JsValue::from_str(&err.to_string()))?;
    if let Err(err) = browser::init_logging(&config.log_filter) {
        web_sys::console::warn_1(&JsValue::from_str(&format!("{err:#}")));
    }

    let manager = GameManager::new(
        config,
        Rc::new(BrowserStage::new(stage)),
        Rc::new(BrowserSpawner),
    );
    if GAME.with(|game| game.set(manager.clone())).is_err() {
        return Err(JsValue::from_str("main_js was already called"));
    }
    info!("rabbit colors starting");

    // spawns a new asynchronous task in local thread, for web assembly
    // environment, using wasm_bindgen_futures
    browser::spawn_local(async move {
        if let Err(err) = GameLoop::start(ColoringGame::new(manager)).await {
            error!("could not start the game loop : {err:#}");
        }
    });

    Ok(())
}

#[wasm_bindgen]
pub fn start_game() -> Result<(), JsValue> {
    with_game(GameManager::start_game)
}

#[wasm_bindgen]
pub fn pause_game() -> Result<(), JsValue> {
    with_game(GameManager::pause_game)
}

#[wasm_bindgen]
pub fn resume_game() -> Result<(), JsValue> {
    with_game(GameManager::resume_game)
}

/// Publish `name` on the game bus, e.g. `PALETTE_COLOR_SELECTED` from the
/// palette or `TASK_STEP_ACTION_COMPLETE` from the drawing board.
#[wasm_bindgen]
pub fn emit_event(name: &str, payload: JsValue) -> Result<(), JsValue> {
    let payload: Value = if payload.is_undefined() || payload.is_null() {
        Value::Null
    } else {
        serde_wasm_bindgen::from_value(payload)
            .map_err(|err| JsValue::from_str(&format!("unreadable payload for {name} : {err}")))?
    };
    with_game(|game| game.emit(name, &payload))
}
