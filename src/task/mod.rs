//! Task documents : what the rabbit asks the child to do, in order.
//!
//! TABLE:
//! ┌──────────────┬──────────────────────────────────────────────────────┐
//! │ Type         │ Role                                                 │
//! ├──────────────┼──────────────────────────────────────────────────────┤
//! │ TaskDocument │ `{ "tasks": [...] }` as fetched at startup           │
//! │ Task         │ id + name + ordered steps (immutable template)       │
//! │ TaskStep     │ one action for the scene, plus how it ends           │
//! │ TaskInstance │ running copy of a Task : cursor + bookkeeping        │
//! │ ColorOption  │ one palette entry, the worklist item of a coloring   │
//! └──────────────┴──────────────────────────────────────────────────────┘
pub mod manager;
pub mod worklist;

pub use manager::{StepPhase, TaskManager};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type Options = Map<String, Value>;

/// Option keys with a fixed meaning
pub mod keys {
    pub const VOICE_OVER: &str = "voiceOver";
    pub const RABBIT_ANIMATION: &str = "rabbitAnimation";
    pub const COLORS: &str = "colors";
    pub const COUNT: &str = "count";
    pub const SELECTED_COLOR_OPTION: &str = "selectedColorOption";
    pub const COMPLETED_ITEM: &str = "completedItem";
    pub const REMAINING: &str = "remaining";
    pub const COLOR_NAME: &str = "colorName";
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorOption {
    pub color_name: String,
    pub target_word: String,
    pub target_shape_outline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spine_name: Option<String>,
    pub color_sound: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub id: String,
    pub action: String,
    /// milliseconds before the step completes on its own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_delay: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Options,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaits_event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data_check: Option<Options>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_list_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step_id_for_itemlist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_if_items_remain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_if_no_items_remain: Option<String>,
    #[serde(default)]
    pub is_end_of_task: bool,
    /// filled in when a picked color is injected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_color_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_item: Option<Value>,
}

impl TaskStep {
    pub fn new(id: &str, action: &str) -> Self {
        TaskStep {
            id: id.to_string(),
            action: action.to_string(),
            next_step_delay: None,
            options: Options::new(),
            awaits_event: None,
            event_data_check: None,
            item_list_name: None,
            source_step_id_for_itemlist: None,
            next_step_if_items_remain: None,
            next_step_if_no_items_remain: None,
            is_end_of_task: false,
            target_color_name: None,
            completed_item: None,
        }
    }

    /// Overlay dynamic data onto the options bag, key by key.
    pub fn inject(&mut self, data: Options) {
        if let Some(name) = data
            .get(keys::SELECTED_COLOR_OPTION)
            .and_then(|option| option.get(keys::COLOR_NAME))
            .and_then(Value::as_str)
        {
            self.target_color_name = Some(name.to_string());
        }
        if let Some(item) = data.get(keys::COMPLETED_ITEM) {
            self.completed_item = Some(item.clone());
        }
        self.options.extend(data);
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn voice_over(&self) -> Option<&str> {
        self.option_str(keys::VOICE_OVER)
    }

    pub fn rabbit_animation(&self) -> Option<&str> {
        self.option_str(keys::RABBIT_ANIMATION)
    }

    pub fn count(&self) -> Option<u32> {
        self.options
            .get(keys::COUNT)
            .and_then(|count| {
                count.as_u64().or_else(|| {
                    count
                        .as_f64()
                        .filter(|count| *count >= 0.0 && count.fract() == 0.0)
                        .map(|count| count as u64)
                })
            })
            .map(|count| count.min(u32::MAX as u64) as u32)
    }

    /// Palette entries; entries that are not color options are skipped.
    pub fn colors(&self) -> Vec<ColorOption> {
        self.options
            .get(keys::COLORS)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `awaitsEvent` wins over `nextStepDelay`
    pub fn waits_for_event(&self) -> bool {
        self.awaits_event.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<TaskStep>,
}

impl Task {
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }
}

/// A Task while it is being played. Created fresh from the template on every
/// start, so bookkeeping never leaks between runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    #[serde(flatten)]
    pub task: Task,
    pub current_step_index: usize,
    /// list name -> items already done, in completion order
    pub completed_items: HashMap<String, Vec<Value>>,
    /// step id -> data to overlay on that step's options when it starts
    pub dynamic_step_data: HashMap<String, Options>,
    pub finished: bool,
}

impl TaskInstance {
    pub fn new(task: Task) -> Self {
        TaskInstance {
            task,
            current_step_index: 0,
            completed_items: HashMap::new(),
            dynamic_step_data: HashMap::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn steps(&self) -> &[TaskStep] {
        &self.task.steps
    }

    pub fn current_template(&self) -> Option<&TaskStep> {
        self.task.steps.get(self.current_step_index)
    }

    /// Cursor sits on the step that ends the task
    pub fn is_at_terminal_step(&self) -> bool {
        let len = self.task.steps.len();
        len == 0
            || self.current_step_index + 1 >= len
            || self
                .current_template()
                .is_some_and(|step| step.is_end_of_task)
    }

    pub fn completed(&self, list: &str) -> &[Value] {
        self.completed_items.get(list).map_or(&[], Vec::as_slice)
    }

    /// Appends unless an item with the same key is already there.
    /// Returns whether the list grew.
    pub fn record_completed(&mut self, list: &str, item: Value, item_key: &str) -> bool {
        let items = self.completed_items.entry(list.to_string()).or_default();
        if items
            .iter()
            .any(|done| worklist::same_item(done, &item, item_key))
        {
            return false;
        }
        items.push(item);
        true
    }

    pub fn stage(&mut self, step_id: &str, data: Options) {
        self.dynamic_step_data.insert(step_id.to_string(), data);
    }
}

/// Document fetched at startup : `{ "tasks": [ ... ] }`
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct TaskDocument {
    pub tasks: Vec<Task>,
}

impl TaskDocument {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value.get("tasks") {
            Some(Value::Array(_)) => Ok(serde_json::from_value(value)?),
            _ => Err(ConfigError::MissingTasks),
        }
    }

    /// Findings that do not stop the game but will make a task misbehave.
    pub fn validate(&self, check_remaining_action: &str) -> Vec<ConfigIssue> {
        validate_tasks(&self.tasks, check_remaining_action)
    }
}

pub fn validate_tasks(tasks: &[Task], check_remaining_action: &str) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    let mut task_ids = HashSet::new();
    for task in tasks {
        if !task_ids.insert(task.id.as_str()) {
            issues.push(ConfigIssue::DuplicateTaskId {
                task: task.id.clone(),
            });
        }
        issues.extend(validate_task(task, check_remaining_action));
    }
    issues
}

pub fn validate_task(task: &Task, check_remaining_action: &str) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();
    let mut step_ids = HashSet::new();
    for step in &task.steps {
        let (task_id, step_id) = (task.id.clone(), step.id.clone());
        if !step_ids.insert(step.id.as_str()) {
            issues.push(ConfigIssue::DuplicateStepId {
                task: task_id.clone(),
                step: step_id.clone(),
            });
        }
        if step.awaits_event.is_some() && step.next_step_delay.is_some() {
            issues.push(ConfigIssue::DelayIgnored {
                task: task_id.clone(),
                step: step_id.clone(),
            });
        }
        for target in [
            &step.next_step_if_items_remain,
            &step.next_step_if_no_items_remain,
        ]
        .into_iter()
        .flatten()
        {
            if *target == step.id {
                issues.push(ConfigIssue::SelfTarget {
                    task: task_id.clone(),
                    step: step_id.clone(),
                });
            } else if task.step(target).is_none() {
                issues.push(ConfigIssue::UnknownTarget {
                    task: task_id.clone(),
                    step: step_id.clone(),
                    target: target.clone(),
                });
            }
        }
        if step.action == check_remaining_action {
            if step.item_list_name.is_none() {
                issues.push(ConfigIssue::MissingItemList {
                    task: task_id.clone(),
                    step: step_id.clone(),
                });
            }
            match &step.source_step_id_for_itemlist {
                Some(source) if task.step(source).is_some() => {}
                source => issues.push(ConfigIssue::UnknownSource {
                    task: task_id,
                    step: step_id,
                    source_step: source.clone().unwrap_or_default(),
                }),
            }
        }
    }
    issues
}

/// Non fatal problems found in a task document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigIssue {
    #[error("task '{task}' is defined more than once")]
    DuplicateTaskId { task: String },

    #[error("task '{task}': step id '{step}' is used more than once")]
    DuplicateStepId { task: String, step: String },

    #[error("task '{task}': step '{step}' awaits an event, its nextStepDelay is ignored")]
    DelayIgnored { task: String, step: String },

    #[error("task '{task}': step '{step}' branches to unknown step '{target}'")]
    UnknownTarget {
        task: String,
        step: String,
        target: String,
    },

    #[error("task '{task}': step '{step}' checks remaining items without an itemListName")]
    MissingItemList { task: String, step: String },

    #[error("task '{task}': step '{step}' branches to itself")]
    SelfTarget { task: String, step: String },

    #[error("task '{task}': step '{step}' reads its item list from unknown step '{source_step}'")]
    UnknownSource {
        task: String,
        step: String,
        source_step: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOCUMENT: &str = r#"{
        "tasks": [{
            "id": "learn_colors_and_shapes",
            "name": "Colors and shapes",
            "steps": [
                { "id": "intro", "action": "RABBIT_SPEECH", "nextStepDelay": 500,
                  "options": { "voiceOver": "sfx_welcome", "rabbitAnimation": "welcome_anim" } },
                { "id": "pick", "action": "SHOW_PALETTE", "awaitsEvent": "PALETTE_COLOR_SELECTED",
                  "options": { "colors": [
                    { "colorName": "red", "targetWord": "apple", "targetShapeOutline": "apple_outline",
                      "spineName": "apple_spine", "colorSound": "sfx_color_red" },
                    { "colorName": "green", "targetWord": "frog", "targetShapeOutline": "frog_outline",
                      "colorSound": "sfx_color_green" }
                  ] } },
                { "id": "color", "action": "SHOW_DRAWING_BOARD_FOR_COLORING" },
                { "id": "check", "action": "CHECK_REMAINING_TASK_ITEMS", "itemListName": "colors",
                  "sourceStepIdForItemlist": "pick", "nextStepIfItemsRemain": "pick",
                  "nextStepIfNoItemsRemain": "pond" },
                { "id": "pond", "action": "ALL_COLORS_DONE_FOCUS_POND", "isEndOfTask": true,
                  "options": { "count": 3 } }
            ]
        }]
    }"#;

    #[test]
    fn parses_task_document_field_names() {
        let document = TaskDocument::from_json(DOCUMENT).unwrap();
        let task = &document.tasks[0];

        assert_eq!(task.steps.len(), 5);
        assert_eq!(task.steps[0].next_step_delay, Some(500.0));
        assert_eq!(task.steps[0].voice_over(), Some("sfx_welcome"));
        assert_eq!(task.steps[1].awaits_event.as_deref(), Some("PALETTE_COLOR_SELECTED"));
        assert_eq!(task.steps[1].colors().len(), 2);
        assert_eq!(task.steps[1].colors()[0].spine_name.as_deref(), Some("apple_spine"));
        assert_eq!(
            task.steps[3].source_step_id_for_itemlist.as_deref(),
            Some("pick")
        );
        assert!(task.steps[4].is_end_of_task);
        assert_eq!(task.steps[4].count(), Some(3));
        assert!(document.validate("CHECK_REMAINING_TASK_ITEMS").is_empty());
    }

    #[test]
    fn document_without_tasks_is_rejected() {
        assert!(matches!(
            TaskDocument::from_json(r#"{ "levels": [] }"#),
            Err(ConfigError::MissingTasks)
        ));
        assert!(matches!(
            TaskDocument::from_json("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn step_without_action_is_malformed() {
        let result = TaskDocument::from_json(r#"{ "tasks": [{ "id": "t", "name": "t", "steps": [{ "id": "s" }] }] }"#);
        assert!(matches!(result, Err(ConfigError::Json(_))));
    }

    #[test]
    fn validation_reports_broken_branches() {
        let mut check = TaskStep::new("check", "CHECK_REMAINING_TASK_ITEMS");
        check.next_step_if_items_remain = Some("missing".into());
        check.source_step_id_for_itemlist = Some("nowhere".into());
        let mut wait = TaskStep::new("wait", "SHOW_PALETTE");
        wait.awaits_event = Some("PICKED".into());
        wait.next_step_delay = Some(100.0);
        let document = TaskDocument {
            tasks: vec![Task {
                id: "t".into(),
                name: "t".into(),
                steps: vec![wait.clone(), wait, check],
            }],
        };

        let issues = document.validate("CHECK_REMAINING_TASK_ITEMS");

        assert!(issues.contains(&ConfigIssue::DuplicateStepId {
            task: "t".into(),
            step: "wait".into()
        }));
        assert!(issues.contains(&ConfigIssue::DelayIgnored {
            task: "t".into(),
            step: "wait".into()
        }));
        assert!(issues.contains(&ConfigIssue::UnknownTarget {
            task: "t".into(),
            step: "check".into(),
            target: "missing".into()
        }));
        assert!(issues.contains(&ConfigIssue::MissingItemList {
            task: "t".into(),
            step: "check".into()
        }));
        assert!(issues.contains(&ConfigIssue::UnknownSource {
            task: "t".into(),
            step: "check".into(),
            source_step: "nowhere".into()
        }));
    }

    #[test]
    fn validation_reports_check_branching_to_itself() {
        let mut pick = TaskStep::new("pick", "SHOW_PALETTE");
        pick.options.insert("colors".into(), json!([]));
        let mut check = TaskStep::new("check", "CHECK_REMAINING_TASK_ITEMS");
        check.item_list_name = Some("colors".into());
        check.source_step_id_for_itemlist = Some("pick".into());
        check.next_step_if_items_remain = Some("check".into());
        let task = Task {
            id: "t".into(),
            name: "t".into(),
            steps: vec![pick, check],
        };

        let issues = validate_task(&task, "CHECK_REMAINING_TASK_ITEMS");

        assert_eq!(
            issues,
            vec![ConfigIssue::SelfTarget {
                task: "t".into(),
                step: "check".into()
            }]
        );
    }

    #[test]
    fn count_accepts_whole_floats_only() {
        let mut step = TaskStep::new("pond", "FOCUS_POND");
        step.options.insert("count".into(), json!(2.0));
        assert_eq!(step.count(), Some(2));

        step.options.insert("count".into(), json!(2.5));
        assert_eq!(step.count(), None);

        step.options.insert("count".into(), json!(-1));
        assert_eq!(step.count(), None);
    }

    #[test]
    fn inject_overlays_options_and_fills_target_color() {
        let mut step = TaskStep::new("color", "SHOW_DRAWING_BOARD_FOR_COLORING");
        step.options.insert("voiceOver".into(), json!("sfx_lets_color"));
        let picked = json!({ "colorName": "blue", "targetWord": "pond" });
        let mut data = Options::new();
        data.insert(keys::SELECTED_COLOR_OPTION.into(), picked.clone());
        data.insert(keys::COMPLETED_ITEM.into(), picked.clone());

        step.inject(data);

        assert_eq!(step.target_color_name.as_deref(), Some("blue"));
        assert_eq!(step.completed_item, Some(picked.clone()));
        assert_eq!(step.voice_over(), Some("sfx_lets_color"));
        assert_eq!(step.options.get(keys::SELECTED_COLOR_OPTION), Some(&picked));
    }

    #[test]
    fn record_completed_dedupes_by_key() {
        let mut instance = TaskInstance::new(Task {
            id: "t".into(),
            name: "t".into(),
            steps: vec![],
        });

        assert!(instance.record_completed("colors", json!({ "colorName": "red", "n": 1 }), "colorName"));
        assert!(!instance.record_completed("colors", json!({ "colorName": "red", "n": 2 }), "colorName"));
        assert!(instance.record_completed("colors", json!({ "colorName": "blue" }), "colorName"));

        assert_eq!(instance.completed("colors").len(), 2);
        assert!(instance.completed("shapes").is_empty());
    }

    #[test]
    fn terminal_step_detection() {
        let mut end = TaskStep::new("end", "RABBIT_SPEECH");
        end.is_end_of_task = true;
        let mut instance = TaskInstance::new(Task {
            id: "t".into(),
            name: "t".into(),
            steps: vec![TaskStep::new("a", "X"), end, TaskStep::new("after", "X")],
        });

        assert!(!instance.is_at_terminal_step());
        instance.current_step_index = 1;
        assert!(instance.is_at_terminal_step());
        instance.current_step_index = 2;
        assert!(instance.is_at_terminal_step());
    }

    #[test]
    fn instance_serializes_runtime_fields() {
        let instance = TaskInstance::new(Task {
            id: "t".into(),
            name: "Task".into(),
            steps: vec![TaskStep::new("a", "X")],
        });
        let value = serde_json::to_value(&instance).unwrap();

        assert_eq!(value["id"], json!("t"));
        assert_eq!(value["currentStepIndex"], json!(0));
        assert_eq!(value["steps"][0]["id"], json!("a"));
        assert_eq!(value["completedItems"], json!({}));
    }
}
