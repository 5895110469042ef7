//! Browser tests, run with `wasm-pack test --headless --firefox`.
#![cfg(target_arch = "wasm32")]

use rabbit_colors::browser;
use rabbit_colors::config::GameConfig;
use rabbit_colors::error::ConfigError;
use wasm_bindgen::JsValue;
use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

#[wasm_bindgen_test]
fn undefined_config_is_default() {
    let config = GameConfig::from_js(JsValue::UNDEFINED).unwrap();
    assert_eq!(config, GameConfig::default());
}

#[wasm_bindgen_test]
fn config_object_from_the_page() {
    let value = js_sys::JSON::parse(r#"{ "tasksUrl": "lesson.json", "rules": { "itemKey": "shape" } }"#)
        .unwrap();

    let config = GameConfig::from_js(value).unwrap();

    assert_eq!(config.tasks_url, "lesson.json");
    assert_eq!(config.rules.item_key, "shape");
    assert_eq!(config.log_filter, "info");
}

#[wasm_bindgen_test]
fn wrongly_typed_config_is_rejected() {
    let value = js_sys::JSON::parse(r#"{ "tasksUrl": 42 }"#).unwrap();

    assert!(matches!(GameConfig::from_js(value), Err(ConfigError::Js(_))));
}

#[wasm_bindgen_test]
fn logging_goes_to_the_console_once() {
    assert!(browser::init_logging("rabbit_colors=loudest").is_err());

    browser::init_logging("debug").unwrap();
    tracing::warn!(step_id = "intro", "written through the console writer");
    tracing::debug!("debug lines use console.debug");

    assert!(browser::init_logging("info").is_err());
}
