use rabbit_colors::config::TaskRules;
use rabbit_colors::events::{names, EventBus};
use rabbit_colors::task::{StepPhase, TaskDocument, TaskManager};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

const DOCUMENT: &str = r#"{
    "tasks": [{
        "id": "paint_colors",
        "name": "Paint the colors",
        "steps": [
            { "id": "intro", "action": "RABBIT_SPEECH", "nextStepDelay": 0 },
            { "id": "pick", "action": "SHOW_PALETTE", "awaitsEvent": "COLOR_PICKED",
              "options": { "colors": [
                { "colorName": "red", "targetWord": "apple", "targetShapeOutline": "apple_outline",
                  "colorSound": "sfx_color_red" },
                { "colorName": "blue", "targetWord": "pond", "targetShapeOutline": "pond_outline",
                  "colorSound": "sfx_color_blue" }
              ] } },
            { "id": "paint", "action": "CHECK_ITEMS", "itemListName": "colors",
              "sourceStepIdForItemlist": "pick", "nextStepIfItemsRemain": "pick",
              "nextStepIfNoItemsRemain": "done" },
            { "id": "done", "action": "RABBIT_SPEECH", "isEndOfTask": true }
        ]
    }]
}"#;

struct Session {
    tasks: TaskManager,
    log: Rc<RefCell<Vec<String>>>,
}

/// A manager wired the way the scene drives it: every completed step is
/// advanced straight away.
fn session() -> Session {
    let rules = TaskRules {
        check_remaining_action: "CHECK_ITEMS".to_string(),
        ..TaskRules::default()
    };
    let tasks = TaskManager::new(EventBus::new(), rules);
    tasks.setup_event_listeners();
    tasks.load_tasks(TaskDocument::from_json(DOCUMENT).unwrap().tasks);

    let log = Rc::new(RefCell::new(Vec::new()));
    for event in [
        names::TASK_START,
        names::TASK_STEP_START,
        names::TASK_STEP_COMPLETE,
        names::TASK_COMPLETE,
        names::ALL_TASKS_COMPLETE,
    ] {
        let log = log.clone();
        tasks.bus().subscribe(event, move |payload| {
            let id = payload
                .get("id")
                .or_else(|| payload.pointer("/step/id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            log.borrow_mut().push(format!("{event}:{id}"));
        });
    }
    let advancer = tasks.clone();
    tasks.bus().subscribe(names::TASK_STEP_COMPLETE, move |_| {
        advancer.advance_to_next_step_or_task();
    });

    Session { tasks, log }
}

fn current(tasks: &TaskManager) -> String {
    tasks.current_step().map(|step| step.id).unwrap_or_default()
}

fn color_names(value: &Value) -> Vec<&str> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["colorName"].as_str())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn coloring_session_runs_to_the_end() {
    let Session { tasks, log } = session();
    let bus = tasks.bus().clone();

    tasks.start_next_task();
    assert_eq!(current(&tasks), "intro");
    assert_eq!(tasks.phase(), StepPhase::AwaitingDelay);

    tasks.tick(16.0);
    assert_eq!(current(&tasks), "pick");
    assert_eq!(tasks.phase(), StepPhase::AwaitingEvent);

    bus.publish("COLOR_PICKED", &json!({ "colorName": "red" }));
    let pick = tasks.current_step().unwrap();
    assert_eq!(pick.id, "pick");
    assert_eq!(color_names(&pick.options["remaining"]), vec!["blue"]);
    assert_eq!(color_names(&pick.options["colors"]), vec!["blue"]);
    assert_eq!(
        tasks.current_task().unwrap().completed("colors"),
        &[json!({ "colorName": "red" })]
    );

    bus.publish("COLOR_PICKED", &json!({ "colorName": "blue" }));
    assert_eq!(current(&tasks), "done");
    assert_eq!(tasks.current_task().unwrap().completed("colors").len(), 2);

    bus.publish(
        names::TASK_STEP_ACTION_COMPLETE,
        &json!({ "stepId": "done", "action": "RABBIT_SPEECH" }),
    );

    assert_eq!(
        *log.borrow(),
        vec![
            "TASK_START:paint_colors",
            "TASK_STEP_START:intro",
            "TASK_STEP_COMPLETE:intro",
            "TASK_STEP_START:pick",
            "TASK_STEP_COMPLETE:pick",
            "TASK_STEP_START:paint",
            "TASK_STEP_START:pick",
            "TASK_STEP_COMPLETE:pick",
            "TASK_STEP_START:paint",
            "TASK_STEP_START:done",
            "TASK_STEP_COMPLETE:done",
            "TASK_COMPLETE:paint_colors",
            "ALL_TASKS_COMPLETE:",
        ]
    );
    assert_eq!(tasks.phase(), StepPhase::Idle);
    assert!(tasks.current_task().is_none());
}

#[test]
fn picks_arriving_before_the_palette_are_ignored() {
    let Session { tasks, .. } = session();
    let bus = tasks.bus().clone();
    tasks.start_next_task();

    bus.publish("COLOR_PICKED", &json!({ "colorName": "red" }));

    assert_eq!(current(&tasks), "intro");
    assert!(tasks.current_task().unwrap().completed("colors").is_empty());
}

#[test]
fn restarting_mid_session_drops_old_timers_and_picks() {
    let Session { tasks, log } = session();
    let bus = tasks.bus().clone();
    tasks.start_next_task();
    tasks.tick(16.0);
    bus.publish("COLOR_PICKED", &json!({ "colorName": "red" }));

    tasks.start_task_by_id("paint_colors");
    log.borrow_mut().clear();
    bus.publish("COLOR_PICKED", &json!({ "colorName": "blue" }));

    // the fresh run is still on its intro : the pick went nowhere
    assert_eq!(current(&tasks), "intro");
    assert!(log.borrow().is_empty());
    assert!(tasks.current_task().unwrap().completed("colors").is_empty());
}
