//! Smart alarm edge agent
//!
//! Runs on the bedside device: monitors sleep data from a wearable,
//! predicts sleep quality locally, fires the alarm at the optimal moment
//! inside the configured wake window, and keeps a device twin loosely
//! synchronized with the cloud over MQTT.

pub mod alarm;
pub mod config;
pub mod events;
pub mod fitbit;
pub mod http;
pub mod model;
pub mod monitor;
pub mod mqtt;
pub mod ports;
pub mod state;
pub mod twin;

pub use alarm::{AlarmEngine, QualitySample, SleepQuality, TriggerReason};
pub use config::EdgeConfig;
pub use twin::{TwinMessage, TwinSettings, TwinSyncClient};
