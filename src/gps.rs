//! GNSS external-interface contract and the lock-protected "latest fix"
//! snapshot.
//!
//! The serial/NMEA driver itself is an external collaborator (out of
//! scope, per the purpose statement); this module only defines the shape
//! of the fix it must publish and the snapshot primitive the processing
//! loop reads it through, in the same `critical_section::Mutex<Cell<_>>`
//! style the host uses for `FILTER_CONFIG`.

use core::cell::Cell;

use critical_section::Mutex;

/// A GNSS fix as published by the GNSS task, ~5 Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssFix {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub sats: u8,
    pub speed: f32,
    pub course: f32,
    pub altitude: f32,
    pub last_update_ms: u32,
}

impl GnssFix {
    pub const INVALID: GnssFix = GnssFix {
        valid: false,
        lat: 0.0,
        lon: 0.0,
        sats: 0,
        speed: 0.0,
        course: 0.0,
        altitude: 0.0,
        last_update_ms: 0,
    };
}

impl Default for GnssFix {
    fn default() -> Self {
        Self::INVALID
    }
}

/// A tiny lock-protected "latest fix" cell, written by the GNSS task and
/// read by the processing loop under the same critical section used for
/// the entity tables (see `tracker::DeviceTracker::set_gps_fix`).
pub struct GnssSnapshot {
    inner: Mutex<Cell<GnssFix>>,
}

impl GnssSnapshot {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Cell::new(GnssFix::INVALID)),
        }
    }

    pub fn set(&self, fix: GnssFix) {
        critical_section::with(|cs| self.inner.borrow(cs).set(fix));
    }

    pub fn get(&self) -> GnssFix {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }
}

impl Default for GnssSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_invalid() {
        let snap = GnssSnapshot::new();
        assert!(!snap.get().valid);
    }

    #[test]
    fn set_then_get_round_trips() {
        let snap = GnssSnapshot::new();
        let fix = GnssFix {
            valid: true,
            lat: 37.7749,
            lon: -122.4194,
            sats: 8,
            speed: 0.0,
            course: 0.0,
            altitude: 10.0,
            last_update_ms: 1000,
        };
        snap.set(fix);
        assert_eq!(snap.get(), fix);
    }
}
