/*!
# SmartAlarm DevKit - Stubs and test utilities

Broker-free mock implementations of the edge agent's ports, plus builders
for twin patches and method requests. Lets the alarm and twin logic be
exercised end to end without an MQTT broker or a Fitbit account.
*/

pub mod builders;
pub mod stubs;

pub use builders::{alarm_patch, cloud_enabled_patch, method_request};
pub use stubs::{
    FixedPredictor, MemoryEventSink, MockTwinTransport, RecordingAlertPublisher,
    ScriptedSleepProvider,
};
