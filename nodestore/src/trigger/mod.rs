// Trigger dispatcher - ordered before/after hooks that may veto an operation

use crate::Document;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerEvent {
    BeforeAdd,
    AfterAdd,
    BeforeSet,
    AfterSet,
    BeforeDelete,
    AfterDelete,
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::BeforeAdd => "before_add",
            TriggerEvent::AfterAdd => "after_add",
            TriggerEvent::BeforeSet => "before_set",
            TriggerEvent::AfterSet => "after_set",
            TriggerEvent::BeforeDelete => "before_delete",
            TriggerEvent::AfterDelete => "after_delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "before_add" => TriggerEvent::BeforeAdd,
            "after_add" => TriggerEvent::AfterAdd,
            "before_set" => TriggerEvent::BeforeSet,
            "after_set" => TriggerEvent::AfterSet,
            "before_delete" => TriggerEvent::BeforeDelete,
            "after_delete" => TriggerEvent::AfterDelete,
            _ => return None,
        })
    }
}

/// What a hook returns: the (possibly rewritten) document, or a veto.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerResult {
    Continue(Document),
    Rollback,
}

/// Context passed to every hook alongside the document.
#[derive(Debug, Clone, Copy)]
pub struct TriggerArgs<'a> {
    pub id: &'a str,
    pub schema: &'a str,
    /// Value before the operation, when there was one
    pub old: Option<&'a Document>,
    /// Data supplied by the caller
    pub data: Option<&'a Document>,
}

pub type Trigger = Arc<dyn Fn(Document, &TriggerArgs<'_>) -> TriggerResult + Send + Sync>;

/// Hooks per event, run in registration order.
#[derive(Clone, Default)]
pub struct Triggers {
    hooks: HashMap<TriggerEvent, Vec<Trigger>>,
}

impl Triggers {
    pub fn add<F>(&mut self, event: TriggerEvent, hook: F)
    where
        F: Fn(Document, &TriggerArgs<'_>) -> TriggerResult + Send + Sync + 'static,
    {
        self.hooks.entry(event).or_default().push(Arc::new(hook));
    }

    pub fn is_empty(&self, event: TriggerEvent) -> bool {
        self.hooks.get(&event).map_or(true, Vec::is_empty)
    }

    /// Chain the hooks of `event`: each one receives the previous result.
    /// The first veto short-circuits the chain.
    pub fn run(&self, event: TriggerEvent, node: Document, args: &TriggerArgs<'_>) -> TriggerResult {
        let mut node = node;
        for hook in self.hooks.get(&event).into_iter().flatten() {
            match hook(node, args) {
                TriggerResult::Continue(next) => node = next,
                TriggerResult::Rollback => {
                    log::debug!("Trigger {} vetoed {}/{}", event.name(), args.schema, args.id);
                    return TriggerResult::Rollback;
                }
            }
        }
        TriggerResult::Continue(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args() -> TriggerArgs<'static> {
        TriggerArgs {
            id: "n1",
            schema: "things",
            old: None,
            data: None,
        }
    }

    #[test]
    fn test_no_hooks_passes_through() {
        let triggers = Triggers::default();
        assert!(triggers.is_empty(TriggerEvent::BeforeAdd));
        let result = triggers.run(TriggerEvent::BeforeAdd, json!({"a": 1}), &args());
        assert_eq!(result, TriggerResult::Continue(json!({"a": 1})));
    }

    #[test]
    fn test_hooks_chain_in_order() {
        let mut triggers = Triggers::default();
        triggers.add(TriggerEvent::BeforeAdd, |mut node, _| {
            node["step"] = json!("first");
            TriggerResult::Continue(node)
        });
        triggers.add(TriggerEvent::BeforeAdd, |mut node, args| {
            node["seen"] = json!(format!("{}:{}", node["step"].as_str().unwrap_or(""), args.id));
            TriggerResult::Continue(node)
        });

        let result = triggers.run(TriggerEvent::BeforeAdd, json!({}), &args());
        assert_eq!(result, TriggerResult::Continue(json!({"step": "first", "seen": "first:n1"})));
    }

    #[test]
    fn test_veto_short_circuits() {
        let mut triggers = Triggers::default();
        triggers.add(TriggerEvent::AfterDelete, |_, _| TriggerResult::Rollback);
        triggers.add(TriggerEvent::AfterDelete, |_, _| panic!("must not run after a veto"));

        let result = triggers.run(TriggerEvent::AfterDelete, json!(null), &args());
        assert_eq!(result, TriggerResult::Rollback);
    }

    #[test]
    fn test_event_names_round_trip() {
        for event in [
            TriggerEvent::BeforeAdd,
            TriggerEvent::AfterAdd,
            TriggerEvent::BeforeSet,
            TriggerEvent::AfterSet,
            TriggerEvent::BeforeDelete,
            TriggerEvent::AfterDelete,
        ] {
            assert_eq!(TriggerEvent::from_name(event.name()), Some(event));
        }
    }
}
