//! Fitbit Web API provider
//!
//! Blocking HTTP client with bearer auth and a single refresh-and-retry on
//! 401. Parses both sleep log formats: "stages" sessions carry a real deep
//! sleep breakdown, "classic" ones do not.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::FitbitConfig;
use crate::ports::{HeartRateSummary, PortError, SleepSession, WearableDataProvider};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Tokens {
    access: String,
    refresh: String,
}

pub struct FitbitClient {
    http: Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    tokens: Mutex<Tokens>,
}

impl FitbitClient {
    /// Returns None when no access token is configured; the caller falls
    /// back to the null provider.
    pub fn from_config(config: &FitbitConfig) -> Option<Self> {
        if config.access_token.is_empty() {
            return None;
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .ok()?;
        Some(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            tokens: Mutex::new(Tokens {
                access: config.access_token.clone(),
                refresh: config.refresh_token.clone(),
            }),
        })
    }

    /// GET with bearer auth; on 401 refreshes the token pair once and
    /// retries.
    fn get_json(&self, path: &str) -> Result<Value, PortError> {
        let url = format!("{}{}", self.api_base, path);
        let access = self.tokens.lock().access.clone();
        let response = self
            .http
            .get(&url)
            .bearer_auth(&access)
            .send()
            .map_err(|e| PortError::Transport(e.to_string()))?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            self.refresh_tokens()?;
            let access = self.tokens.lock().access.clone();
            self.http
                .get(&url)
                .bearer_auth(&access)
                .send()
                .map_err(|e| PortError::Transport(e.to_string()))?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(PortError::Provider(format!(
                "fitbit returned {} for {path}",
                response.status()
            )));
        }
        response
            .json()
            .map_err(|e| PortError::Provider(format!("invalid json from {path}: {e}")))
    }

    fn refresh_tokens(&self) -> Result<(), PortError> {
        let refresh = self.tokens.lock().refresh.clone();
        if refresh.is_empty() {
            return Err(PortError::Provider("access token expired, no refresh token".into()));
        }
        info!("refreshing fitbit access token");

        let response = self
            .http
            .post(format!("{}/oauth2/token", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.as_str()),
            ])
            .send()
            .map_err(|e| PortError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PortError::Provider(format!(
                "token refresh failed: {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .map_err(|e| PortError::Provider(format!("invalid token response: {e}")))?;

        let mut tokens = self.tokens.lock();
        if let Some(access) = body.get("access_token").and_then(Value::as_str) {
            tokens.access = access.to_string();
        }
        if let Some(refresh) = body.get("refresh_token").and_then(Value::as_str) {
            tokens.refresh = refresh.to_string();
        }
        Ok(())
    }
}

impl WearableDataProvider for FitbitClient {
    fn fetch_latest_session(&self) -> Result<Option<SleepSession>, PortError> {
        let today = chrono::Local::now().date_naive();
        let body = self.get_json(&format!("/1.2/user/-/sleep/date/{today}.json"))?;

        let sessions = body
            .get("sleep")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if sessions.is_empty() {
            return Ok(None);
        }
        // Main sleep first, otherwise the first entry of the day
        let main = sessions
            .iter()
            .find(|s| s.get("isMainSleep").and_then(Value::as_bool) == Some(true))
            .unwrap_or(&sessions[0]);
        Ok(session_from_json(main))
    }

    fn fetch_heart_rate(&self, date: NaiveDate) -> Result<Option<HeartRateSummary>, PortError> {
        let body = self.get_json(&format!("/1/user/-/activities/heart/date/{date}/1d.json"))?;

        let rhr = body
            .get("activities-heart")
            .and_then(Value::as_array)
            .and_then(|days| days.first())
            .and_then(|day| day.get("value"))
            .and_then(|v| v.get("restingHeartRate"))
            .and_then(Value::as_f64);

        if rhr.is_none() {
            warn!("no resting heart rate in fitbit response for {date}");
        }
        Ok(Some(HeartRateSummary {
            resting_heart_rate: rhr,
        }))
    }
}

/// Maps one Fitbit sleep log entry to a session. Returns None when the
/// entry is missing the fields the feature extractor needs.
pub fn session_from_json(entry: &Value) -> Option<SleepSession> {
    let date = entry
        .get("dateOfSleep")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())?;
    let minutes_asleep = entry.get("minutesAsleep").and_then(Value::as_u64)? as u32;
    let minutes_awake = entry.get("minutesAwake").and_then(Value::as_u64).unwrap_or(0) as u32;
    let efficiency = entry.get("efficiency").and_then(Value::as_u64).unwrap_or(0) as u32;

    let end_time = entry
        .get("endTime")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f").ok());

    let is_stages = entry.get("type").and_then(Value::as_str) == Some("stages");
    let deep_sleep_minutes = if is_stages {
        entry
            .get("levels")
            .and_then(|l| l.get("summary"))
            .and_then(|s| s.get("deep"))
            .and_then(|d| d.get("minutes"))
            .and_then(Value::as_f64)
    } else {
        None
    };

    Some(SleepSession {
        date,
        end_time,
        minutes_asleep,
        minutes_awake,
        efficiency,
        deep_sleep_minutes,
        is_stages,
    })
}
