//! Builders for twin patches and method requests used in tests

use serde_json::{json, Map, Value};

use smartalarm_edge::twin::TwinMessage;

/// Desired patch that arms the alarm
pub fn alarm_patch(time: &str, window_minutes: i64) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("alarm_time".into(), json!(time));
    patch.insert("smart_wakeup_window".into(), json!(window_minutes));
    patch.insert("alarm_enabled".into(), json!(true));
    patch.insert("$version".into(), json!(1));
    patch
}

/// Desired patch toggling cloud publishing
pub fn cloud_enabled_patch(enabled: bool) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("cloud_enabled".into(), json!(enabled));
    patch
}

/// Direct method request as the twin worker receives it
pub fn method_request(name: &str, request_id: &str, payload: Value) -> TwinMessage {
    TwinMessage::Method {
        name: name.to_string(),
        request_id: request_id.to_string(),
        payload,
    }
}
