//! Vendor/OUI lookup and the passive BLE trackable-beacon classifier.
//!
//! Both are pure functions: MAC → Vendor, and advertisement → TrackerInfo.
//! Grounded in the host's `filter::check_mac_oui`/`defaults::MAC_PREFIXES`
//! (linear scan over a static `(prefix, tag)` table, first match wins) and
//! its `scanner::BleAdvParser` AD-structure walk, but the table contents and
//! the classifier's decision order are specific to this domain (general
//! consumer-device vendors and commercial lost-item trackers, not
//! surveillance-camera signatures).

/// Coarse vendor classification for a Track or Anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Unknown,
    Apple,
    Google,
    Samsung,
    Tile,
    Chipolo,
    Pebblebee,
    /// A known OUI without a dedicated variant above.
    Named(&'static str),
}

/// Known MAC OUI prefixes (top 24 bits) to vendor names.
static OUI_TABLE: &[([u8; 3], &'static str)] = &[
    ([0x00, 0x03, 0x93], "Apple"),
    ([0x00, 0x0A, 0x27], "Apple"),
    ([0x00, 0x0A, 0x95], "Apple"),
    ([0x3C, 0x07, 0x54], "Apple"),
    ([0xF0, 0x18, 0x98], "Apple"),
    ([0xA4, 0xD1, 0xD2], "Apple"),
    ([0xDC, 0xA9, 0x04], "Apple"),
    ([0x00, 0x12, 0x47], "Samsung"),
    ([0x00, 0x15, 0x99], "Samsung"),
    ([0x5C, 0x0A, 0x5B], "Samsung"),
    ([0xC8, 0xA8, 0x23], "Samsung"),
    ([0x94, 0xEB, 0x2C], "Google"),
    ([0xF4, 0xF5, 0xE8], "Google"),
    ([0x54, 0x60, 0x09], "Google"),
    ([0x24, 0x6F, 0x28], "Espressif"),
    ([0x30, 0xAE, 0xA4], "Espressif"),
    ([0xAC, 0x67, 0xB2], "Espressif"),
    ([0xCC, 0x50, 0xE3], "Espressif"),
    ([0x78, 0x11, 0xDC], "Xiaomi"),
    ([0xF0, 0xB4, 0x29], "Xiaomi"),
    ([0x5C, 0xAA, 0xFD], "Sonos"),
    ([0x68, 0x37, 0xE9], "Amazon"),
    ([0xFC, 0x65, 0xDE], "Amazon"),
    ([0xB8, 0x27, 0xEB], "Raspberry Pi"),
    ([0xDC, 0xA6, 0x32], "Raspberry Pi"),
    ([0x00, 0x1B, 0x77], "Intel"),
    ([0x3C, 0xA9, 0xF4], "Intel"),
    ([0x70, 0x56, 0x81], "Murata"),
];

/// Look up a static vendor tag for the top 24 bits of `mac`.
pub fn vendor_for_mac(mac: &[u8; 6]) -> Vendor {
    let oui = [mac[0], mac[1], mac[2]];
    for &(prefix, name) in OUI_TABLE {
        if oui == prefix {
            return match name {
                "Apple" => Vendor::Apple,
                "Samsung" => Vendor::Samsung,
                "Google" => Vendor::Google,
                other => Vendor::Named(other),
            };
        }
    }
    Vendor::Unknown
}

/// Render a [`Vendor`] as a display string for status output.
pub fn vendor_str(v: Vendor) -> &'static str {
    match v {
        Vendor::Unknown => "Unknown",
        Vendor::Apple => "Apple",
        Vendor::Google => "Google",
        Vendor::Samsung => "Samsung",
        Vendor::Tile => "Tile",
        Vendor::Chipolo => "Chipolo",
        Vendor::Pebblebee => "Pebblebee",
        Vendor::Named(name) => name,
    }
}

/// True if the locally-administered bit (bit 1 of the first octet) is set
/// — typically a randomized or software-assigned address.
pub fn is_locally_administered(mac: &[u8; 6]) -> bool {
    (mac[0] & 0x02) != 0
}

// ── BLE trackable-beacon classifier ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerType {
    Unknown,
    Tile,
    SmartThingsTracker,
    SmartThingsFind,
    GoogleFindHub,
    PebbleBee,
    AppleAirPods,
    AppleFindMy,
    AppleAirTag,
    Chipolo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoogleMfr {
    Unknown,
    PebbleBee,
    Chipolo,
    Eufy,
    Motorola,
    Jio,
    RollingSquare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamsungSubtype {
    Unknown,
    SmartTag1,
    SmartTag1Plus,
    SmartTag2,
    Solum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerInfo {
    pub tracker_type: TrackerType,
    pub google_mfr: GoogleMfr,
    pub samsung_subtype: SamsungSubtype,
    pub confidence: u8,
}

impl TrackerInfo {
    const fn unknown() -> Self {
        Self {
            tracker_type: TrackerType::Unknown,
            google_mfr: GoogleMfr::Unknown,
            samsung_subtype: SamsungSubtype::Unknown,
            confidence: 0,
        }
    }
}

/// Derive a coarse Vendor tag from a classified tracker type.
pub fn vendor_from_tracker_type(t: TrackerType) -> Vendor {
    match t {
        TrackerType::AppleAirPods | TrackerType::AppleFindMy | TrackerType::AppleAirTag => {
            Vendor::Apple
        }
        TrackerType::Chipolo => Vendor::Chipolo,
        TrackerType::GoogleFindHub => Vendor::Google,
        TrackerType::PebbleBee => Vendor::Pebblebee,
        TrackerType::SmartThingsTracker | TrackerType::SmartThingsFind => Vendor::Samsung,
        TrackerType::Tile => Vendor::Tile,
        TrackerType::Unknown => Vendor::Unknown,
    }
}

const UUID_TILE: u16 = 0xFEED;
const UUID_SMARTTHINGS_TRACKER: u16 = 0xFD5A;
const UUID_SMARTTHINGS_FIND: u16 = 0xFD69;
const UUID_GOOGLE_FIND_HUB: u16 = 0xFEAA;
const UUID_PEBBLEBEE: u16 = 0xFA25;
const UUID_CHIPOLO_FALLBACK: u16 = 0xFE33;
const APPLE_COMPANY_ID: u16 = 0x004C;

fn contains_ci(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    // `no_std`-safe case-insensitive substring search over ASCII; local
    // names in practice are ASCII.
    let h: heapless::Vec<u8, 64> = haystack.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let n: heapless::Vec<u8, 64> = needle.bytes().map(|b| b.to_ascii_lowercase()).collect();
    if n.is_empty() || h.len() < n.len() {
        return false;
    }
    h.windows(n.len()).any(|w| w == n.as_slice())
}

fn google_mfr_from_name(name: &str) -> GoogleMfr {
    if contains_ci(name, "pebblebee") {
        GoogleMfr::PebbleBee
    } else if contains_ci(name, "chipolo") {
        GoogleMfr::Chipolo
    } else if contains_ci(name, "eufy") {
        GoogleMfr::Eufy
    } else if contains_ci(name, "motorola") || contains_ci(name, "moto") {
        GoogleMfr::Motorola
    } else if contains_ci(name, "jio") {
        GoogleMfr::Jio
    } else if contains_ci(name, "rolling square") {
        GoogleMfr::RollingSquare
    } else {
        GoogleMfr::Unknown
    }
}

fn samsung_subtype_from_name(name: &str) -> SamsungSubtype {
    if contains_ci(name, "smarttag2") || contains_ci(name, "smart tag 2") {
        SamsungSubtype::SmartTag2
    } else if contains_ci(name, "solum") {
        SamsungSubtype::Solum
    } else if contains_ci(name, "smarttag+") {
        SamsungSubtype::SmartTag1Plus
    } else if contains_ci(name, "smarttag") {
        SamsungSubtype::SmartTag1
    } else {
        SamsungSubtype::Unknown
    }
}

/// Classify a BLE advertisement against the fixed, first-match-wins
/// decision table. `mfg` is `(company_id, payload_after_company_id)`.
pub fn classify(service_uuids_16: &[u16], mfg: Option<(u16, &[u8])>, local_name: Option<&str>) -> TrackerInfo {
    let name = local_name.unwrap_or("");

    if service_uuids_16.contains(&UUID_TILE) {
        return TrackerInfo {
            tracker_type: TrackerType::Tile,
            confidence: 95,
            ..TrackerInfo::unknown()
        };
    }
    if service_uuids_16.contains(&UUID_SMARTTHINGS_TRACKER) {
        return TrackerInfo {
            tracker_type: TrackerType::SmartThingsTracker,
            samsung_subtype: samsung_subtype_from_name(name),
            confidence: 95,
            ..TrackerInfo::unknown()
        };
    }
    if service_uuids_16.contains(&UUID_SMARTTHINGS_FIND) {
        return TrackerInfo {
            tracker_type: TrackerType::SmartThingsFind,
            confidence: 90,
            ..TrackerInfo::unknown()
        };
    }
    if service_uuids_16.contains(&UUID_GOOGLE_FIND_HUB) {
        return TrackerInfo {
            tracker_type: TrackerType::GoogleFindHub,
            google_mfr: google_mfr_from_name(name),
            confidence: 90,
            ..TrackerInfo::unknown()
        };
    }
    if service_uuids_16.contains(&UUID_PEBBLEBEE) {
        return TrackerInfo {
            tracker_type: TrackerType::PebbleBee,
            confidence: 90,
            ..TrackerInfo::unknown()
        };
    }

    if let Some((company, payload)) = mfg {
        if company == APPLE_COMPANY_ID && payload.len() >= 2 && payload[0] == 0x12 && payload[1] == 0x19 {
            if payload.len() >= 3 {
                let status = payload[2] & 0x18;
                if status == 0x18 {
                    return TrackerInfo {
                        tracker_type: TrackerType::AppleAirPods,
                        confidence: 85,
                        ..TrackerInfo::unknown()
                    };
                }
                if status == 0x10 {
                    if service_uuids_16.contains(&UUID_CHIPOLO_FALLBACK) {
                        return TrackerInfo {
                            tracker_type: TrackerType::AppleFindMy,
                            confidence: 80,
                            ..TrackerInfo::unknown()
                        };
                    }
                    return TrackerInfo {
                        tracker_type: TrackerType::AppleAirTag,
                        confidence: 75,
                        ..TrackerInfo::unknown()
                    };
                }
            }
            return TrackerInfo {
                tracker_type: TrackerType::AppleFindMy,
                confidence: 65,
                ..TrackerInfo::unknown()
            };
        }
    }

    if service_uuids_16.contains(&UUID_CHIPOLO_FALLBACK) {
        return TrackerInfo {
            tracker_type: TrackerType::Chipolo,
            confidence: 80,
            ..TrackerInfo::unknown()
        };
    }

    TrackerInfo::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_lookup_known_oui() {
        assert_eq!(vendor_for_mac(&[0x00, 0x03, 0x93, 0, 0, 0]), Vendor::Apple);
        assert_eq!(vendor_for_mac(&[0x24, 0x6F, 0x28, 0, 0, 0]), Vendor::Named("Espressif"));
    }

    #[test]
    fn vendor_lookup_unknown_oui() {
        assert_eq!(vendor_for_mac(&[0xFF, 0xFF, 0xFF, 0, 0, 0]), Vendor::Unknown);
    }

    #[test]
    fn vendor_str_renders_named_and_known_variants() {
        assert_eq!(vendor_str(Vendor::Apple), "Apple");
        assert_eq!(vendor_str(Vendor::Named("Espressif")), "Espressif");
        assert_eq!(vendor_str(Vendor::Unknown), "Unknown");
    }

    #[test]
    fn locally_administered_bit() {
        assert!(is_locally_administered(&[0x02, 0, 0, 0, 0, 0]));
        assert!(!is_locally_administered(&[0x00, 0, 0, 0, 0, 0]));
    }

    // ── Scenario 2: classifier — Tile ──────────────────────────────
    #[test]
    fn classify_tile() {
        let info = classify(&[UUID_TILE], None, None);
        assert_eq!(info.tracker_type, TrackerType::Tile);
        assert_eq!(info.confidence, 95);
        assert_eq!(info.google_mfr, GoogleMfr::Unknown);
        assert_eq!(info.samsung_subtype, SamsungSubtype::Unknown);
    }

    // ── Scenario 3: classifier — AirTag via Apple mfg data ─────────
    #[test]
    fn classify_airtag() {
        let payload = [0x12, 0x19, 0x10];
        let info = classify(&[], Some((APPLE_COMPANY_ID, &payload)), None);
        assert_eq!(info.tracker_type, TrackerType::AppleAirTag);
        assert_eq!(info.confidence, 75);
    }

    #[test]
    fn classify_findmy_when_airtag_status_but_chipolo_uuid_present() {
        let payload = [0x12, 0x19, 0x10];
        let info = classify(&[UUID_CHIPOLO_FALLBACK], Some((APPLE_COMPANY_ID, &payload)), None);
        assert_eq!(info.tracker_type, TrackerType::AppleFindMy);
        assert_eq!(info.confidence, 80);
    }

    #[test]
    fn classify_airpods_status_bits() {
        let payload = [0x12, 0x19, 0x18];
        let info = classify(&[], Some((APPLE_COMPANY_ID, &payload)), None);
        assert_eq!(info.tracker_type, TrackerType::AppleAirPods);
        assert_eq!(info.confidence, 85);
    }

    #[test]
    fn classify_apple_short_payload_fallback() {
        let payload = [0x12, 0x19];
        let info = classify(&[], Some((APPLE_COMPANY_ID, &payload)), None);
        assert_eq!(info.tracker_type, TrackerType::AppleFindMy);
        assert_eq!(info.confidence, 65);
    }

    #[test]
    fn classify_chipolo_fallback_non_apple() {
        let info = classify(&[UUID_CHIPOLO_FALLBACK], None, None);
        assert_eq!(info.tracker_type, TrackerType::Chipolo);
        assert_eq!(info.confidence, 80);
    }

    #[test]
    fn classify_unknown() {
        let info = classify(&[], None, None);
        assert_eq!(info.tracker_type, TrackerType::Unknown);
        assert_eq!(info.confidence, 0);
    }

    #[test]
    fn classify_google_find_hub_infers_manufacturer_from_name() {
        let info = classify(&[UUID_GOOGLE_FIND_HUB], None, Some("Eufy SmartTrack Link"));
        assert_eq!(info.tracker_type, TrackerType::GoogleFindHub);
        assert_eq!(info.google_mfr, GoogleMfr::Eufy);
    }

    #[test]
    fn classify_smartthings_tracker_infers_subtype_from_name() {
        let info = classify(&[UUID_SMARTTHINGS_TRACKER], None, Some("Galaxy SmartTag2"));
        assert_eq!(info.tracker_type, TrackerType::SmartThingsTracker);
        assert_eq!(info.samsung_subtype, SamsungSubtype::SmartTag2);
    }

    #[test]
    fn classify_is_deterministic() {
        let a = classify(&[UUID_TILE], None, Some("whatever"));
        let b = classify(&[UUID_TILE], None, Some("whatever"));
        assert_eq!(a, b);
    }

    #[test]
    fn vendor_from_type_mapping() {
        assert_eq!(vendor_from_tracker_type(TrackerType::AppleAirTag), Vendor::Apple);
        assert_eq!(vendor_from_tracker_type(TrackerType::Tile), Vendor::Tile);
        assert_eq!(vendor_from_tracker_type(TrackerType::Unknown), Vendor::Unknown);
    }
}
