//! Mutual exclusion between the dispense and drain processes, and the
//! targets the control loop runs them towards.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("process already in progress")]
pub struct Busy;

/// Invariant: `dispensing` and `draining` are never both set. A process can
/// only begin while neither is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessGuard {
    dispensing: bool,
    draining: bool,
    deactivate_requested: bool,
}

impl ProcessGuard {
    pub fn dispensing(&self) -> bool {
        self.dispensing
    }

    pub fn draining(&self) -> bool {
        self.draining
    }

    pub fn deactivate_requested(&self) -> bool {
        self.deactivate_requested
    }

    pub fn is_busy(&self) -> bool {
        self.dispensing || self.draining
    }

    pub(crate) fn begin_dispense(&mut self) -> Result<(), Busy> {
        if self.is_busy() {
            return Err(Busy);
        }
        self.dispensing = true;
        Ok(())
    }

    pub(crate) fn begin_drain(&mut self) -> Result<(), Busy> {
        if self.is_busy() {
            return Err(Busy);
        }
        self.draining = true;
        Ok(())
    }

    /// Flag the running process for cancellation. The control loop observes
    /// the flag and calls [`finish`](Self::finish).
    pub fn request_deactivate(&mut self) {
        self.deactivate_requested = true;
    }

    /// Clear every flag once the control loop has stopped the process.
    pub fn finish(&mut self) {
        *self = Self::default();
    }
}

/// The single target of a drain activation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrainTarget {
    TimeSecs(f32),
    Volume(f32),
    Pressure(f32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TargetParameters {
    /// Liters.
    pub output_volume: f32,
    pub drain_time_secs: f32,
    /// Liters.
    pub drain_volume: f32,
    pub drain_pressure: f32,
}

impl TargetParameters {
    /// Set one drain target and zero the other two.
    pub fn set_drain(&mut self, target: DrainTarget) {
        self.drain_time_secs = 0.0;
        self.drain_volume = 0.0;
        self.drain_pressure = 0.0;
        match target {
            DrainTarget::TimeSecs(v) => self.drain_time_secs = v,
            DrainTarget::Volume(v) => self.drain_volume = v,
            DrainTarget::Pressure(v) => self.drain_pressure = v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_guard_is_not_busy() {
        let g = ProcessGuard::default();
        assert!(!g.is_busy());
        assert!(!g.deactivate_requested());
    }

    #[test]
    fn dispense_blocks_drain() {
        let mut g = ProcessGuard::default();
        g.begin_dispense().unwrap();
        assert_eq!(g.begin_drain(), Err(Busy));
        assert!(g.dispensing());
        assert!(!g.draining());
    }

    #[test]
    fn drain_blocks_dispense_and_second_drain() {
        let mut g = ProcessGuard::default();
        g.begin_drain().unwrap();
        assert_eq!(g.begin_dispense(), Err(Busy));
        assert_eq!(g.begin_drain(), Err(Busy));
        assert!(!g.dispensing());
    }

    #[test]
    fn finish_clears_everything() {
        let mut g = ProcessGuard::default();
        g.begin_drain().unwrap();
        g.request_deactivate();
        g.finish();
        assert_eq!(g, ProcessGuard::default());
        g.begin_dispense().unwrap();
    }

    #[test]
    fn deactivate_does_not_clear_process() {
        let mut g = ProcessGuard::default();
        g.begin_dispense().unwrap();
        g.request_deactivate();
        assert!(g.dispensing());
        assert!(g.deactivate_requested());
    }

    #[test]
    fn set_drain_zeroes_other_targets() {
        let mut t = TargetParameters {
            output_volume: 4.0,
            drain_time_secs: 10.0,
            drain_volume: 2.0,
            drain_pressure: 1.0,
        };
        t.set_drain(DrainTarget::Pressure(3.5));
        assert_eq!(t.drain_time_secs, 0.0);
        assert_eq!(t.drain_volume, 0.0);
        assert_eq!(t.drain_pressure, 3.5);
        assert_eq!(t.output_volume, 4.0);
    }
}
