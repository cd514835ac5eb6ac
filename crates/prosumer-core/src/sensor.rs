//! Power sensor seam

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;

use crate::types::SensorSample;
use crate::{ProsumerError, Result};

/// Source of periodic power samples
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Take one sample; the caller controls cadence
    async fn read_sample(&self) -> Result<SensorSample>;
}

/// Sensor producing bench-style readings
///
/// Voltage is drawn from 10..=12 and current from 1..=2. Power is the configured
/// constant, or voltage times current when none is set.
pub struct SimulatedSensor {
    fixed_power: Option<f64>,
}

impl SimulatedSensor {
    pub fn new(fixed_power: Option<f64>) -> Self {
        Self { fixed_power }
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    async fn read_sample(&self) -> Result<SensorSample> {
        let mut rng = rand::thread_rng();
        let voltage = rng.gen_range(10..=12) as f64;
        let current = rng.gen_range(1..=2) as f64;
        let power = self.fixed_power.unwrap_or(voltage * current);
        Ok(SensorSample {
            voltage,
            current,
            power,
        })
    }
}

/// Sensor replaying a fixed script of results, then repeating the last power
pub struct ScriptedSensor {
    script: Mutex<VecDeque<std::result::Result<f64, String>>>,
    fallback_power: f64,
}

impl ScriptedSensor {
    /// Every sample reports `power`
    pub fn constant(power: f64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback_power: power,
        }
    }

    /// Replay `script`; `Err` entries become sensor failures
    pub fn from_script(
        script: impl IntoIterator<Item = std::result::Result<f64, String>>,
        fallback_power: f64,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback_power,
        }
    }
}

#[async_trait]
impl SensorSource for ScriptedSensor {
    async fn read_sample(&self) -> Result<SensorSample> {
        let next = self.script.lock().pop_front();
        let power = match next {
            Some(Ok(power)) => power,
            Some(Err(message)) => return Err(ProsumerError::Sensor(message)),
            None => self.fallback_power,
        };
        Ok(SensorSample {
            voltage: 11.0,
            current: if power > 0.0 { power / 11.0 } else { 0.0 },
            power,
        })
    }
}
