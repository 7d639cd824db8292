#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::*;
use std::time::Duration;

// ---------------------------------------------------------------------------
// 1. ResourceRequest serialization roundtrip keeps line items and lease
// ---------------------------------------------------------------------------

#[test]
fn resource_request_roundtrip() {
    let request = ResourceRequest::new(
        "render-job",
        vec![ResourceSpec::gpu(1.0), ResourceSpec::memory(2048.0)],
    )
    .with_priority(Priority::Critical)
    .with_duration(Duration::from_secs(30));

    let json = serde_json::to_string(&request).unwrap();
    assert!(json.contains("\"type\":\"gpu\""));
    assert!(json.contains("\"duration\":30000"));

    let parsed: ResourceRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.id, request.id);
    assert_eq!(parsed.requester_id, "render-job");
    assert_eq!(parsed.priority, Priority::Critical);
    assert_eq!(parsed.duration, Some(Duration::from_secs(30)));
    assert_eq!(parsed.resources, request.resources);
}

// ---------------------------------------------------------------------------
// 2. Error display strings carry their context
// ---------------------------------------------------------------------------

#[test]
fn error_messages_carry_context() {
    let err = MaestroError::CapacityExceeded { active: 4, max: 4 };
    assert_eq!(
        err.to_string(),
        "Capacity exceeded: 4 of 4 concurrent workflows active"
    );

    let err = MaestroError::TaskTimeout {
        task_id: "compile".into(),
        timeout_ms: 250,
    };
    assert!(err.to_string().contains("compile"));
    assert!(err.to_string().contains("250ms"));

    let err = MaestroError::Deadlock {
        blocked: vec!["x".into(), "y".into()],
    };
    assert_eq!(err.to_string(), "Deadlock: 2 task(s) can never become ready: x, y");
}

// ---------------------------------------------------------------------------
// 3. Missing optional fields fall back to defaults
// ---------------------------------------------------------------------------

#[test]
fn resource_spec_defaults_unit() {
    let spec: ResourceSpec = serde_json::from_str(r#"{"type": "memory", "amount": 64}"#).unwrap();
    assert_eq!(spec.resource_type, ResourceType::Memory);
    assert_eq!(spec.unit, "");
    assert_eq!(ResourceSpec::memory(64.0).unit, "mb");
}
