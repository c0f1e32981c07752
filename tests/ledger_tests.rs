use std::sync::Arc;

use async_trait::async_trait;
use enactor::ledger::{classify_action_type, CompensationOptions, Reversibility, UnitState};
use enactor::{
    ActionDescriptor, CompensationLedger, EventBus, ExecutedAction, FaultPayload, InverseOperation,
    RetryEngine,
};
use enactor::retry::PolicyRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};

struct RecordingInverse {
    calls: Mutex<Vec<String>>,
    fail_types: Vec<&'static str>,
}

impl RecordingInverse {
    fn new(fail_types: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_types,
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl InverseOperation for RecordingInverse {
    async fn invert(
        &self,
        entry: &ExecutedAction,
    ) -> std::result::Result<Value, FaultPayload> {
        self.calls.lock().push(entry.action_type.clone());
        if self.fail_types.contains(&entry.action_type.as_str()) {
            Err(FaultPayload::new("undo rejected").with_status(400))
        } else {
            Ok(json!({"undone": entry.action_type}))
        }
    }
}

fn ledger() -> CompensationLedger {
    let events = EventBus::default();
    let engine = Arc::new(RetryEngine::new(PolicyRegistry::default(), events.clone()));
    CompensationLedger::new(engine, events)
}

fn append(ledger: &CompensationLedger, unit: &str, action_type: &str, param: Value) {
    let action = ActionDescriptor::new("s1", action_type, "crm").with_parameter("value", param);
    ledger.append(unit, &action, json!({"ok": true})).unwrap();
}

#[test]
fn test_reversibility_classification() {
    assert_eq!(classify_action_type("create_task"), Reversibility::Reversible);
    assert_eq!(
        classify_action_type("update_contact"),
        Reversibility::PartiallyReversible
    );
    assert_eq!(
        classify_action_type("delete_record"),
        Reversibility::ConfirmationRequired
    );
    assert_eq!(classify_action_type("add_comment"), Reversibility::NonReversible);
    assert_eq!(classify_action_type("launch_rocket"), Reversibility::NonReversible);
}

#[tokio::test]
async fn test_compensation_walks_in_reverse_order() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("create_task", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_event", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_note", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "create_event", json!("B"));
    append(&ledger, "u-1", "create_note", json!("C"));

    let report = ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();

    assert_eq!(
        inverse.calls(),
        vec!["create_note", "create_event", "create_task"]
    );
    assert!(report.success);
    assert_eq!(report.final_state, UnitState::Compensated);
    assert_eq!(report.compensated.len(), 3);
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_failed_step_does_not_halt_the_walk() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec!["create_event"]);
    ledger.register_inverse("create_task", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_event", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_note", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "create_event", json!("B"));
    append(&ledger, "u-1", "create_note", json!("C"));

    let report = ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();

    // B failed but A was still attempted.
    assert_eq!(
        inverse.calls(),
        vec!["create_note", "create_event", "create_task"]
    );
    assert!(!report.success);
    assert_eq!(report.final_state, UnitState::PartiallyCompensated);
    assert_eq!(report.compensated.len(), 2);
    assert_eq!(report.failed.len(), 1);
    // The failed step lands in the manual follow-up list with an instruction.
    assert_eq!(report.manual_steps_required, report.failed);
    assert!(report.manual_instructions[0].contains("create_event"));
}

#[tokio::test]
async fn test_stop_on_failure_halts_the_walk() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec!["create_event"]);
    ledger.register_inverse("create_task", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_event", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("create_note", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "create_event", json!("B"));
    append(&ledger, "u-1", "create_note", json!("C"));

    let report = ledger
        .compensate(
            "u-1",
            CompensationOptions::default().with_stop_on_failure(true),
        )
        .await
        .unwrap();

    assert_eq!(inverse.calls(), vec!["create_note", "create_event"]);
    assert_eq!(report.compensated.len(), 1);
    assert_eq!(report.failed.len(), 1);
}

#[tokio::test]
async fn test_non_reversible_action_becomes_instruction() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("create_task", Arc::clone(&inverse) as Arc<dyn InverseOperation>);
    ledger.register_inverse("add_comment", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "add_comment", json!("B"));

    let report = ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();

    // The comment's inverse is registered but must never be called.
    assert_eq!(inverse.calls(), vec!["create_task"]);
    assert_eq!(report.manual_steps_required.len(), 1);
    assert!(report.manual_instructions[0].contains("add_comment"));
    // Manual steps are not failures.
    assert!(report.success);
    assert_eq!(report.final_state, UnitState::PartiallyCompensated);
}

#[tokio::test]
async fn test_confirmation_required_can_be_bypassed() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("delete_record", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "held").unwrap();
    append(&ledger, "u-1", "delete_record", json!("A"));
    let held = ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();
    assert!(inverse.calls().is_empty());
    assert_eq!(held.manual_steps_required.len(), 1);

    ledger.begin("u-2", "released").unwrap();
    append(&ledger, "u-2", "delete_record", json!("A"));
    let released = ledger
        .compensate(
            "u-2",
            CompensationOptions::default().with_require_confirmation(false),
        )
        .await
        .unwrap();
    assert_eq!(inverse.calls(), vec!["delete_record"]);
    assert_eq!(released.final_state, UnitState::Compensated);
}

#[tokio::test]
async fn test_partially_reversible_needs_previous_state() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("update_contact", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "edits").unwrap();
    let with_state = ActionDescriptor::new("s1", "update_contact", "crm")
        .with_parameter("email", json!("new@x.io"))
        .with_parameter("previous_state", json!({"email": "old@x.io"}));
    ledger.append("u-1", &with_state, json!({"ok": true})).unwrap();
    let without_state = ActionDescriptor::new("s2", "update_contact", "crm")
        .with_parameter("email", json!("other@x.io"));
    ledger.append("u-1", &without_state, json!({"ok": true})).unwrap();

    let report = ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();

    assert_eq!(inverse.calls(), vec!["update_contact"]);
    assert_eq!(report.compensated.len(), 1);
    assert_eq!(report.manual_steps_required.len(), 1);
    assert!(report.manual_instructions[0].contains("no previous state"));
}

#[tokio::test]
async fn test_partial_compensation_unwinds_newest_entries() {
    let ledger = ledger();
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("create_task", Arc::clone(&inverse) as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "create_task", json!("B"));
    append(&ledger, "u-1", "create_task", json!("C"));

    let report = ledger
        .partial_compensate("u-1", 1, CompensationOptions::default())
        .await
        .unwrap();

    assert_eq!(inverse.calls().len(), 1);
    assert_eq!(report.compensated.len(), 1);
    assert_eq!(report.final_state, UnitState::PartiallyCompensated);
}

#[tokio::test]
async fn test_validate_previews_the_walk() {
    let ledger = ledger();
    ledger.begin("u-1", "mixed").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    append(&ledger, "u-1", "update_contact", json!("B"));
    append(&ledger, "u-1", "delete_record", json!("C"));
    append(&ledger, "u-1", "add_comment", json!("D"));

    let plan = ledger.validate("u-1").unwrap();

    assert!(plan.can_compensate);
    assert_eq!(plan.reversible, 1);
    assert_eq!(plan.partially_reversible, 1);
    assert_eq!(plan.confirmation_required, 1);
    assert_eq!(plan.non_reversible, 1);
    // No inverse registered and no previous state captured.
    assert!(!plan.warnings.is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let engine = Arc::new(RetryEngine::new(PolicyRegistry::default(), events.clone()));
    let ledger = CompensationLedger::new(engine, events);
    let inverse = RecordingInverse::new(vec![]);
    ledger.register_inverse("create_task", inverse as Arc<dyn InverseOperation>);

    ledger.begin("u-1", "triage").unwrap();
    append(&ledger, "u-1", "create_task", json!("A"));
    ledger.complete("u-1").unwrap();
    ledger
        .compensate("u-1", CompensationOptions::default())
        .await
        .unwrap();

    let mut types = Vec::new();
    while let Some(event) = receiver.try_recv() {
        types.push(event.event_type());
    }
    assert_eq!(
        types,
        vec![
            "unit_started",
            "action_recorded",
            "unit_archived",
            "compensation_started",
            "compensation_finished",
        ]
    );
}
