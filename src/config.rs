use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use wasm_bindgen::JsValue;

/// Top level settings handed to `main_js` by the page.
/// - every field is optional on the JS side, missing ones fall back to
/// `Default`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameConfig {
    pub tasks_url: String,
    pub log_filter: String,
    pub background_music: String,
    pub rules: TaskRules,
}

impl Default for GameConfig {
    fn default() -> Self {
        GameConfig {
            tasks_url: "assets/config/tasks.json".to_string(),
            log_filter: "info".to_string(),
            background_music: "bgm_main".to_string(),
            rules: TaskRules::default(),
        }
    }
}

impl GameConfig {
    /// `undefined` and `null` mean "use defaults"
    pub fn from_js(value: JsValue) -> Result<Self, ConfigError> {
        if value.is_undefined() || value.is_null() {
            return Ok(GameConfig::default());
        }
        Ok(serde_wasm_bindgen::from_value(value)?)
    }
}

/// Action tags and keys the task orchestrator treats specially. Everything
/// else in a step's `action` is opaque to it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskRules {
    /// step action that branches on a worklist instead of waiting
    pub check_remaining_action: String,
    /// step action whose completion records a finished worklist item
    pub coloring_action: String,
    /// list used for bookkeeping when a coloring step names none
    pub default_item_list: String,
    /// field that identifies a worklist item
    pub item_key: String,
}

impl Default for TaskRules {
    fn default() -> Self {
        TaskRules {
            check_remaining_action: "CHECK_REMAINING_TASK_ITEMS".to_string(),
            coloring_action: "SHOW_DRAWING_BOARD_FOR_COLORING".to_string(),
            default_item_list: "colors".to_string(),
            item_key: "colorName".to_string(),
        }
    }
}
