//! Time-series telemetry sinks
//!
//! Publishing is best-effort: the agent spawns each publish, bounds it with the call
//! timeout and only logs failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use crate::config::AdafruitSettings;
use crate::{ProsumerError, Result};

/// Destination for power samples
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn publish(&self, series: &str, value: f64, timestamp: DateTime<Utc>) -> Result<()>;

    fn name(&self) -> String;
}

/// Discards everything
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn publish(&self, _series: &str, _value: f64, _timestamp: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        "noop".to_string()
    }
}

/// Writes samples to the log
pub struct LogSink;

#[async_trait]
impl TelemetrySink for LogSink {
    async fn publish(&self, series: &str, value: f64, timestamp: DateTime<Utc>) -> Result<()> {
        info!(series, value, %timestamp, "telemetry sample");
        Ok(())
    }

    fn name(&self) -> String {
        "log".to_string()
    }
}

#[derive(Serialize)]
struct DataPoint {
    value: f64,
    created_at: String,
}

/// Adafruit IO feed writer
pub struct AdafruitIoSink {
    client: reqwest::Client,
    settings: AdafruitSettings,
}

impl AdafruitIoSink {
    pub fn new(settings: AdafruitSettings, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, settings })
    }

    /// Data endpoint of `series`
    pub fn feed_url(&self, series: &str) -> String {
        format!(
            "{}/{}/feeds/{}/data",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.username,
            series
        )
    }
}

#[async_trait]
impl TelemetrySink for AdafruitIoSink {
    async fn publish(&self, series: &str, value: f64, timestamp: DateTime<Utc>) -> Result<()> {
        let point = DataPoint {
            value,
            created_at: timestamp.to_rfc3339(),
        };
        let response = self
            .client
            .post(self.feed_url(series))
            .header("X-AIO-Key", &self.settings.key)
            .json(&point)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProsumerError::Telemetry(format!(
                "feed {} rejected sample: HTTP {}",
                series,
                response.status()
            )));
        }
        Ok(())
    }

    fn name(&self) -> String {
        "adafruit-io".to_string()
    }
}
