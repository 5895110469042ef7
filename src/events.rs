use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::{trace, warn};

/// Event names shared by the task orchestrator, the scene and the page.
pub mod names {
    // published by the task orchestrator
    pub const TASK_START: &str = "TASK_START";
    pub const TASK_STEP_START: &str = "TASK_STEP_START";
    pub const TASK_STEP_COMPLETE: &str = "TASK_STEP_COMPLETE";
    pub const TASK_COMPLETE: &str = "TASK_COMPLETE";
    pub const ALL_TASKS_COMPLETE: &str = "ALL_TASKS_COMPLETE";

    // consumed by the task orchestrator
    pub const TASK_STEP_ACTION_COMPLETE: &str = "TASK_STEP_ACTION_COMPLETE";

    // published by the page
    pub const PALETTE_COLOR_SELECTED: &str = "PALETTE_COLOR_SELECTED";

    // game lifecycle
    pub const GAME_LOADING_START: &str = "GAME_LOADING_START";
    pub const GAME_READY: &str = "GAME_READY";
    pub const GAME_START: &str = "GAME_START";
    pub const GAME_PAUSED: &str = "GAME_PAUSED";
    pub const GAME_RESUMED: &str = "GAME_RESUMED";
    pub const GAME_STATE_CHANGED: &str = "GAME_STATE_CHANGED";
}

pub type Payload = Value;

type Listener = Rc<dyn Fn(&Payload)>;

/// Handle returned by `subscribe`, needed to remove that one listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
}

/// Process wide publish/subscribe channel.
///
/// ELI5:
/// ┌──────────────────── publish("A") ─────────────────────┐
/// │  1. copy the listener list for "A"                    │
/// │  2. release the registry                              │
/// │  3. call each listener in registration order          │
/// │     └─► listener publishes "B"                        │
/// │         └─► every "B" listener runs NOW (depth first) │
/// │  4. return once the last "A" listener returns         │
/// └───────────────────────────────────────────────────────┘
/// - no buffering : publishing with no listeners drops the event
/// - the list is copied before dispatch, so a listener removed while "A" is
/// being dispatched still sees that one publish of "A"
///
/// Single threaded : the bus is an `Rc` handle, clones share one registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Rc<RefCell<Registry>>,
}

/// Non owning handle, for listeners that need to reach the bus they live on
/// without keeping it alive.
#[derive(Clone, Default)]
pub struct WeakEventBus {
    registry: Weak<RefCell<Registry>>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.registry.upgrade().map(|registry| EventBus { registry })
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            registry: Rc::downgrade(&self.registry),
        }
    }

    pub fn subscribe<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Payload) + 'static,
    {
        let mut registry = self.registry.borrow_mut();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((id, Rc::new(listener)));
        id
    }

    /// Returns false when no such listener was registered for `event`.
    pub fn unsubscribe(&self, event: &str, id: ListenerId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let Some(listeners) = registry.listeners.get_mut(event) else {
            return false;
        };
        let Some(position) = listeners.iter().position(|(lid, _)| *lid == id) else {
            return false;
        };
        listeners.remove(position);
        if listeners.is_empty() {
            registry.listeners.remove(event);
        }
        true
    }

    pub fn unsubscribe_all(&self) {
        self.registry.borrow_mut().listeners.clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry
            .borrow()
            .listeners
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn publish(&self, event: &str, payload: &Payload) {
        // snapshot, then drop the borrow : listeners are free to (un)subscribe
        // and publish while we iterate
        let listeners: Vec<Listener> = match self.registry.borrow().listeners.get(event) {
            Some(listeners) => listeners.iter().map(|(_, l)| Rc::clone(l)).collect(),
            None => {
                trace!(event, "no listeners, event dropped");
                return;
            }
        };
        trace!(event, listeners = listeners.len(), "publish");
        for listener in listeners {
            listener(payload);
        }
    }

    /// `publish` for anything serializable
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(payload) => self.publish(event, &payload),
            Err(err) => warn!(event, %err, "could not serialize event payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Payload)>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let make = move |tag: &str| -> Box<dyn Fn(&Payload)> {
            let log = log2.clone();
            let tag = tag.to_string();
            Box::new(move |_payload: &Payload| log.borrow_mut().push(tag.clone()))
        };
        (log, make)
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe("tick", make("first"));
        bus.subscribe("tick", make("second"));
        bus.subscribe("other", make("other"));

        bus.publish("tick", &Payload::Null);

        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn publish_without_listeners_is_dropped() {
        let bus = EventBus::new();
        bus.publish("nobody", &json!({ "x": 1 }));
        assert_eq!(bus.listener_count("nobody"), 0);
    }

    #[test]
    fn payload_reaches_listener() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Payload::Null));
        let seen2 = seen.clone();
        bus.subscribe("picked", move |payload| *seen2.borrow_mut() = payload.clone());

        bus.emit("picked", &json!({ "colorName": "red" }));

        assert_eq!(*seen.borrow(), json!({ "colorName": "red" }));
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = bus.subscribe("tick", make("first"));
        bus.subscribe("tick", make("second"));

        assert!(bus.unsubscribe("tick", first));
        assert!(!bus.unsubscribe("tick", first));
        bus.publish("tick", &Payload::Null);

        assert_eq!(*log.borrow(), vec!["second"]);
        assert_eq!(bus.listener_count("tick"), 1);
    }

    #[test]
    fn unsubscribe_all_clears_every_event() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe("a", make("a"));
        bus.subscribe("b", make("b"));

        bus.unsubscribe_all();
        bus.publish("a", &Payload::Null);
        bus.publish("b", &Payload::Null);

        assert!(log.borrow().is_empty());
    }

    #[test]
    fn nested_publish_dispatches_depth_first() {
        let bus = EventBus::new();
        let log = Rc::new(RefCell::new(Vec::<&str>::new()));

        let (inner_bus, l) = (bus.clone(), log.clone());
        bus.subscribe("outer", move |_| {
            l.borrow_mut().push("outer:before");
            inner_bus.publish("inner", &Payload::Null);
            l.borrow_mut().push("outer:after");
        });
        let l = log.clone();
        bus.subscribe("outer", move |_| l.borrow_mut().push("outer:second"));
        let l = log.clone();
        bus.subscribe("inner", move |_| l.borrow_mut().push("inner"));

        bus.publish("outer", &Payload::Null);

        assert_eq!(
            *log.borrow(),
            vec!["outer:before", "inner", "outer:after", "outer:second"]
        );
    }

    #[test]
    fn listener_can_remove_itself_while_dispatching() {
        let bus = EventBus::new();
        let calls = Rc::new(Cell::new(0));
        let id_slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));

        let (b, c, slot) = (bus.downgrade(), calls.clone(), id_slot.clone());
        let id = bus.subscribe("once", move |_| {
            c.set(c.get() + 1);
            if let (Some(bus), Some(id)) = (b.upgrade(), slot.get()) {
                bus.unsubscribe("once", id);
            }
        });
        id_slot.set(Some(id));

        bus.publish("once", &Payload::Null);
        bus.publish("once", &Payload::Null);

        assert_eq!(calls.get(), 1);
        assert_eq!(bus.listener_count("once"), 0);
    }

    #[test]
    fn listener_removed_mid_dispatch_still_sees_current_publish() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let victim_slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));

        let (b, slot) = (bus.downgrade(), victim_slot.clone());
        bus.subscribe("tick", move |_| {
            if let (Some(bus), Some(id)) = (b.upgrade(), slot.get()) {
                bus.unsubscribe("tick", id);
            }
        });
        victim_slot.set(Some(bus.subscribe("tick", make("victim"))));

        bus.publish("tick", &Payload::Null);
        bus.publish("tick", &Payload::Null);

        assert_eq!(*log.borrow(), vec!["victim"]);
    }

    #[test]
    fn weak_handle_does_not_keep_bus_alive() {
        let bus = EventBus::new();
        let weak = bus.downgrade();
        assert!(weak.upgrade().is_some());
        drop(bus);
        assert!(weak.upgrade().is_none());
    }
}
