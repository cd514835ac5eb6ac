//! Running total of locally generated, not yet auctioned energy
//!
//! Every operation takes the meter lock exactly once, so a sample, the threshold
//! check and the reset are never observed half-applied.

use tracing::debug;

use crate::snapshot::{new_shared_meter, ReportSnapshot, SharedMeter};
use crate::types::MeterReading;

/// Result of folding one reading into the accumulator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOutcome {
    /// Stored total right after the sample was added
    pub total: f64,
    /// Energy captured for an auction, if the threshold was crossed
    pub captured: Option<f64>,
}

/// Thread-safe energy accumulator
#[derive(Clone)]
pub struct EnergyAccumulator {
    meter: SharedMeter,
    sample_weight: f64,
}

impl EnergyAccumulator {
    /// Accumulator adding each sample's power once
    pub fn new() -> Self {
        Self::with_sample_weight(1.0)
    }

    /// Accumulator adding `power * sample_weight` per sample
    pub fn with_sample_weight(sample_weight: f64) -> Self {
        Self {
            meter: new_shared_meter(),
            sample_weight,
        }
    }

    /// Reader handle sharing this accumulator's lock
    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot::new(self.meter.clone())
    }

    /// Currently stored total
    pub fn total(&self) -> f64 {
        self.meter.lock().stored
    }

    /// Energy captured for a submission whose outcome is not known yet
    pub fn in_flight(&self) -> f64 {
        self.meter.lock().in_flight
    }

    /// Add one power sample and return the new total
    pub fn add_sample(&self, power: f64) -> f64 {
        let mut cell = self.meter.lock();
        cell.stored += self.contribution(power);
        cell.stored
    }

    /// Capture and reset the total if it strictly exceeds `threshold`
    ///
    /// The captured value is held as in flight until the caller passes it to
    /// [`settle`](Self::settle) or [`restore`](Self::restore).
    pub fn take_and_reset_if_above_threshold(&self, threshold: f64) -> Option<f64> {
        let mut cell = self.meter.lock();
        if cell.stored > threshold {
            let captured = cell.stored;
            cell.stored = 0.0;
            cell.in_flight += captured;
            Some(captured)
        } else {
            None
        }
    }

    /// Add a reading, publish it, and check the threshold in one lock scope
    pub fn accumulate(&self, reading: MeterReading, threshold: f64) -> SampleOutcome {
        let mut cell = self.meter.lock();
        cell.stored += self.contribution(reading.power);
        let total = cell.stored;

        let captured = if cell.stored > threshold {
            let captured = cell.stored;
            cell.stored = 0.0;
            cell.in_flight += captured;
            Some(captured)
        } else {
            None
        };

        cell.reading = reading;
        SampleOutcome { total, captured }
    }

    /// Merge a captured value back after a failed submission
    pub fn restore(&self, captured: f64) {
        let mut cell = self.meter.lock();
        cell.in_flight = (cell.in_flight - captured).max(0.0);
        cell.stored += captured;
        debug!("Restored {} energy units, total now {}", captured, cell.stored);
    }

    /// Clear a captured value after a successful submission of `submitted` units
    ///
    /// Whatever part of `captured` was not submitted stays in the total. That sub-unit
    /// remainder is what the integer `generateEnergy` amount cannot carry.
    pub fn settle(&self, captured: f64, submitted: u64) {
        let mut cell = self.meter.lock();
        cell.in_flight = (cell.in_flight - captured).max(0.0);
        let remainder = captured - submitted as f64;
        if remainder > 0.0 {
            cell.stored += remainder;
        }
    }

    fn contribution(&self, power: f64) -> f64 {
        if power.is_finite() && power > 0.0 {
            power * self.sample_weight
        } else {
            0.0
        }
    }
}

impl Default for EnergyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn reading(power: f64) -> MeterReading {
        MeterReading {
            timestamp: Utc::now(),
            voltage: 11.0,
            current: 1.0,
            power,
        }
    }

    #[test]
    fn test_threshold_scenario() {
        let acc = EnergyAccumulator::new();

        for _ in 0..6 {
            let outcome = acc.accumulate(reading(8.0), 50.0);
            assert!(outcome.captured.is_none());
        }
        assert_eq!(acc.total(), 48.0);

        let outcome = acc.accumulate(reading(8.0), 50.0);
        assert_eq!(outcome.total, 56.0);
        assert_eq!(outcome.captured, Some(56.0));
        assert_eq!(acc.total(), 0.0);
        acc.settle(56.0, 56);

        let outcome = acc.accumulate(reading(8.0), 50.0);
        assert!(outcome.captured.is_none());
        assert_eq!(acc.total(), 8.0);
    }

    #[test]
    fn test_threshold_is_strict() {
        let acc = EnergyAccumulator::new();
        acc.add_sample(50.0);
        assert_eq!(acc.take_and_reset_if_above_threshold(50.0), None);
        assert_eq!(acc.total(), 50.0);
    }

    #[test]
    fn test_restore_after_failed_submission() {
        let acc = EnergyAccumulator::new();
        acc.add_sample(60.0);
        let captured = acc.take_and_reset_if_above_threshold(50.0).unwrap();
        assert_eq!(acc.in_flight(), 60.0);

        acc.add_sample(4.0);
        acc.restore(captured);
        assert_eq!(acc.total(), 64.0);
        assert_eq!(acc.in_flight(), 0.0);
    }

    #[test]
    fn test_settle_carries_fractional_remainder() {
        let acc = EnergyAccumulator::new();
        acc.add_sample(50.75);
        let captured = acc.take_and_reset_if_above_threshold(50.0).unwrap();
        assert_eq!(acc.in_flight(), 50.75);
        acc.settle(captured, 50);
        assert!((acc.total() - 0.75).abs() < 1e-9);
        assert_eq!(acc.in_flight(), 0.0);
    }

    #[test]
    fn test_sample_weight_and_invalid_power() {
        let acc = EnergyAccumulator::with_sample_weight(5.0);
        assert_eq!(acc.add_sample(2.0), 10.0);
        assert_eq!(acc.add_sample(-3.0), 10.0);
        assert_eq!(acc.add_sample(f64::NAN), 10.0);
    }

    #[test]
    fn test_accumulate_publishes_reading() {
        let acc = EnergyAccumulator::new();
        let snapshot = acc.snapshot();
        let r = reading(8.0);
        acc.accumulate(r, 50.0);
        assert_eq!(snapshot.current_reading(), r);
        assert_eq!(snapshot.report().stored_energy, 8.0);
    }

    #[test]
    fn test_concurrent_samples_and_takes_conserve_energy() {
        let acc = Arc::new(EnergyAccumulator::new());
        let taken = Arc::new(parking_lot::Mutex::new(0.0f64));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let acc = acc.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    acc.add_sample(1.0);
                }
            }));
        }
        for _ in 0..2 {
            let acc = acc.clone();
            let taken = taken.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(value) = acc.take_and_reset_if_above_threshold(10.0) {
                        *taken.lock() += value;
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acc.total() + *taken.lock(), 4000.0);
    }

    proptest! {
        #[test]
        fn prop_total_is_sum_of_samples(samples in prop::collection::vec(0u32..1000, 0..64)) {
            let acc = EnergyAccumulator::new();
            let mut last = 0.0;
            for power in &samples {
                last = acc.add_sample(*power as f64);
            }
            let expected: f64 = samples.iter().map(|p| *p as f64).sum();
            prop_assert_eq!(acc.total(), expected);
            prop_assert_eq!(last, expected);
        }

        #[test]
        fn prop_take_returns_iff_above_threshold(
            stored in 0u32..500,
            threshold in 0u32..500,
        ) {
            let acc = EnergyAccumulator::new();
            acc.add_sample(stored as f64);
            match acc.take_and_reset_if_above_threshold(threshold as f64) {
                Some(value) => {
                    prop_assert!(stored > threshold);
                    prop_assert_eq!(value, stored as f64);
                    prop_assert_eq!(acc.total(), 0.0);
                }
                None => {
                    prop_assert!(stored <= threshold);
                    prop_assert_eq!(acc.total(), stored as f64);
                }
            }
        }
    }
}
