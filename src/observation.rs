//! The Observation record: the single value type carried from radio
//! callbacks, through the queue, into the processing loop.

use crate::wids::{GoogleMfr, SamsungSubtype, TrackerType};

/// What produced an [`Observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    WifiProbeReq,
    WifiApBeacon,
    WifiApProbeResp,
    BleAdv,
}

/// A single radio observation: a Wi-Fi management frame or a BLE
/// advertisement, reduced to the fields the tracker cares about.
///
/// Copied by value through the queue — no references, no allocation.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub kind: ObservationKind,
    pub rssi_dbm: i8,
    pub addr: [u8; 6],
    pub ssid: [u8; 32],
    pub ssid_len: u8,
    pub ts_s: u32,
    /// Meaningful only when `kind == BleAdv`; `TrackerType::Unknown`
    /// otherwise.
    pub tracker_type: TrackerType,
    pub google_mfr: GoogleMfr,
    pub samsung_subtype: SamsungSubtype,
    pub confidence: u8,
}

impl Observation {
    /// A Wi-Fi observation (no classifier fields; SSID may be empty for a
    /// hidden network or a probe request/data frame).
    pub fn wifi(kind: ObservationKind, addr: [u8; 6], rssi_dbm: i8, ssid: &str, ts_s: u32) -> Self {
        let mut buf = [0u8; 32];
        let bytes = ssid.as_bytes();
        let n = bytes.len().min(32);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self {
            kind,
            rssi_dbm,
            addr,
            ssid: buf,
            ssid_len: n as u8,
            ts_s,
            tracker_type: TrackerType::Unknown,
            google_mfr: GoogleMfr::Unknown,
            samsung_subtype: SamsungSubtype::Unknown,
            confidence: 0,
        }
    }

    /// A BLE advertisement observation, including classifier output.
    #[allow(clippy::too_many_arguments)]
    pub fn ble(
        addr: [u8; 6],
        rssi_dbm: i8,
        ts_s: u32,
        tracker_type: TrackerType,
        google_mfr: GoogleMfr,
        samsung_subtype: SamsungSubtype,
        confidence: u8,
    ) -> Self {
        Self {
            kind: ObservationKind::BleAdv,
            rssi_dbm,
            addr,
            ssid: [0u8; 32],
            ssid_len: 0,
            ts_s,
            tracker_type,
            google_mfr,
            samsung_subtype,
            confidence,
        }
    }

    pub fn ssid_str(&self) -> &str {
        core::str::from_utf8(&self.ssid[..self.ssid_len as usize]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_observation_truncates_long_ssid() {
        let long = "x".repeat(40);
        let obs = Observation::wifi(
            ObservationKind::WifiApBeacon,
            [0; 6],
            -50,
            &long,
            10,
        );
        assert_eq!(obs.ssid_len, 32);
        assert_eq!(obs.ssid_str().len(), 32);
    }

    #[test]
    fn wifi_observation_empty_ssid_is_hidden() {
        let obs = Observation::wifi(ObservationKind::WifiApBeacon, [0; 6], -50, "", 10);
        assert_eq!(obs.ssid_len, 0);
        assert_eq!(obs.ssid_str(), "");
    }

    #[test]
    fn ble_observation_carries_classifier_output() {
        let obs = Observation::ble(
            [1, 2, 3, 4, 5, 6],
            -60,
            100,
            TrackerType::Tile,
            GoogleMfr::Unknown,
            SamsungSubtype::Unknown,
            95,
        );
        assert_eq!(obs.kind, ObservationKind::BleAdv);
        assert_eq!(obs.tracker_type, TrackerType::Tile);
        assert_eq!(obs.confidence, 95);
    }
}
