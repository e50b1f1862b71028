//! Watchlist persistence: a small JSON-like document parsed with
//! `serde`/`serde-json-core` on the read path, and hand-written on the
//! write/KML path so the exact field formatting (8-decimal coordinates,
//! `&#10;`-escaped KML descriptions) is under our control — the allocation
//! discipline explicitly carves out an exception for these two writers.
//!
//! The `kind` field cannot be an internally-tagged enum under
//! `serde-json-core`; it is read into a `heapless::String` and matched by
//! hand.

use core::fmt::Write as _;

use serde::de::{SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::tracker::{DeviceTracker, EntityKind, FLAG_HAS_GEO, FLAG_WATCHING, TrackKind};
use crate::wids::{GoogleMfr, SamsungSubtype, TrackerType};
use crate::wire::push_json_escaped;

/// Keeps the JSON scratch buffer's worst-case size bounded, on both the
/// read and the write path — items past this cap are skipped and counted,
/// never a parse failure or an unbounded write.
pub const MAX_WATCHLIST_ITEMS: usize = 64;

#[derive(Debug, Deserialize)]
struct WatchlistItemRaw {
    kind: heapless::String<16>,
    mac: heapless::String<20>,
    #[serde(default)]
    ssid: Option<heapless::String<32>>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    tracker_type: Option<heapless::String<24>>,
    #[serde(default)]
    tracker_google_mfr: Option<heapless::String<16>>,
    #[serde(default)]
    tracker_samsung_subtype: Option<heapless::String<16>>,
    #[serde(default)]
    tracker_confidence: Option<u8>,
}

/// The `items` array, deserialized one element at a time so a document
/// with more than `MAX_WATCHLIST_ITEMS` entries degrades the same way a
/// malformed item does — the rest are skipped and counted — rather than
/// failing the whole parse the way `heapless::Vec`'s own `Deserialize`
/// does once its fixed capacity is exceeded.
struct WatchlistItems {
    items: heapless::Vec<WatchlistItemRaw, MAX_WATCHLIST_ITEMS>,
    over_cap: u32,
}

impl<'de> Deserialize<'de> for WatchlistItems {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ItemsVisitor;

        impl<'de> Visitor<'de> for ItemsVisitor {
            type Value = WatchlistItems;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.write_str("an array of watchlist items")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = heapless::Vec::new();
                let mut over_cap = 0u32;
                while let Some(raw) = seq.next_element::<WatchlistItemRaw>()? {
                    if items.push(raw).is_err() {
                        over_cap += 1;
                    }
                }
                Ok(WatchlistItems { items, over_cap })
            }
        }

        deserializer.deserialize_seq(ItemsVisitor)
    }
}

#[derive(Debug, Deserialize)]
struct WatchlistDoc {
    #[allow(dead_code)]
    version: u8,
    items: WatchlistItems,
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let s = s.trim();
    if s.len() != 17 {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, part) in s.split(':').enumerate() {
        if i >= 6 || part.len() != 2 {
            return None;
        }
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

pub(crate) fn format_mac(addr: &[u8; 6]) -> heapless::String<17> {
    let mut s = heapless::String::new();
    let _ = write!(
        s,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]
    );
    s
}

pub(crate) fn parse_kind(s: &str) -> Option<EntityKind> {
    match s {
        "WifiAp" => Some(EntityKind::WifiAp),
        "WifiClient" => Some(EntityKind::WifiClient),
        "BleAdv" => Some(EntityKind::BleAdv),
        _ => None,
    }
}

pub(crate) fn tracker_type_str(t: TrackerType) -> Option<&'static str> {
    match t {
        TrackerType::Unknown => None,
        TrackerType::Tile => Some("Tile"),
        TrackerType::SmartThingsTracker => Some("SmartThingsTracker"),
        TrackerType::SmartThingsFind => Some("SmartThingsFind"),
        TrackerType::GoogleFindHub => Some("GoogleFindHub"),
        TrackerType::PebbleBee => Some("PebbleBee"),
        TrackerType::AppleAirPods => Some("AirPods"),
        TrackerType::AppleFindMy => Some("FindMy"),
        TrackerType::AppleAirTag => Some("AirTag"),
        TrackerType::Chipolo => Some("Chipolo"),
    }
}

fn tracker_type_from_str(s: &str) -> TrackerType {
    match s {
        "Tile" => TrackerType::Tile,
        "SmartThingsTracker" => TrackerType::SmartThingsTracker,
        "SmartThingsFind" => TrackerType::SmartThingsFind,
        "GoogleFindHub" => TrackerType::GoogleFindHub,
        "PebbleBee" => TrackerType::PebbleBee,
        "AirPods" => TrackerType::AppleAirPods,
        "FindMy" => TrackerType::AppleFindMy,
        "AirTag" => TrackerType::AppleAirTag,
        "Chipolo" => TrackerType::Chipolo,
        _ => TrackerType::Unknown,
    }
}

pub(crate) fn google_mfr_str(m: GoogleMfr) -> Option<&'static str> {
    match m {
        GoogleMfr::Unknown => None,
        GoogleMfr::PebbleBee => Some("PebbleBee"),
        GoogleMfr::Chipolo => Some("Chipolo"),
        GoogleMfr::Eufy => Some("Eufy"),
        GoogleMfr::Motorola => Some("Motorola"),
        GoogleMfr::Jio => Some("Jio"),
        GoogleMfr::RollingSquare => Some("RollingSquare"),
    }
}

fn google_mfr_from_str(s: &str) -> GoogleMfr {
    match s {
        "PebbleBee" => GoogleMfr::PebbleBee,
        "Chipolo" => GoogleMfr::Chipolo,
        "Eufy" => GoogleMfr::Eufy,
        "Motorola" => GoogleMfr::Motorola,
        "Jio" => GoogleMfr::Jio,
        "RollingSquare" => GoogleMfr::RollingSquare,
        _ => GoogleMfr::Unknown,
    }
}

pub(crate) fn samsung_subtype_str(s: SamsungSubtype) -> Option<&'static str> {
    match s {
        SamsungSubtype::Unknown => None,
        SamsungSubtype::SmartTag1 => Some("SmartTag1"),
        SamsungSubtype::SmartTag1Plus => Some("SmartTag1Plus"),
        SamsungSubtype::SmartTag2 => Some("SmartTag2"),
        SamsungSubtype::Solum => Some("Solum"),
    }
}

fn samsung_subtype_from_str(s: &str) -> SamsungSubtype {
    match s {
        "SmartTag1" => SamsungSubtype::SmartTag1,
        "SmartTag1Plus" => SamsungSubtype::SmartTag1Plus,
        "SmartTag2" => SamsungSubtype::SmartTag2,
        "Solum" => SamsungSubtype::Solum,
        _ => SamsungSubtype::Unknown,
    }
}

/// Returns `false` if the document itself is malformed (bad JSON, missing
/// `items`); individual malformed items, and items past `MAX_WATCHLIST_ITEMS`,
/// are skipped and logged, not fatal. `now_s` seeds `first_seen_s`/
/// `last_seen_s` for entities restored without ever being observed on the
/// radio.
pub fn read_watchlist(json: &str, tracker: &DeviceTracker, now_s: u32) -> bool {
    let doc: WatchlistDoc = match serde_json_core::from_str(json) {
        Ok((doc, _rest)) => doc,
        Err(_) => {
            log::warn!("watchlist document failed to parse, load aborted");
            return false;
        }
    };

    let mut skipped = doc.items.over_cap;
    for raw in doc.items.items.iter() {
        if apply_item(raw, tracker, now_s).is_none() {
            skipped += 1;
        }
    }
    if skipped > 0 {
        log::warn!("{} watchlist items skipped (malformed or past the {} item cap)", skipped, MAX_WATCHLIST_ITEMS);
    }
    true
}

fn apply_item(raw: &WatchlistItemRaw, tracker: &DeviceTracker, now_s: u32) -> Option<()> {
    let kind = parse_kind(&raw.kind)?;
    let addr = parse_mac(&raw.mac)?;

    tracker.with_tables_mut(|tables| -> Option<()> {
        match kind {
            EntityKind::WifiAp => {
                let i = tables.find_or_alloc_anchor(addr, now_s)?;
                let a = tables.anchors[i].as_mut()?;
                a.flags |= FLAG_WATCHING;
                if let Some(ssid) = &raw.ssid {
                    let bytes = ssid.as_bytes();
                    let n = bytes.len().min(32);
                    a.ssid[..n].copy_from_slice(&bytes[..n]);
                    a.ssid_len = n as u8;
                }
                if let (Some(lat), Some(lon)) = (raw.lat, raw.lon) {
                    a.flags |= FLAG_HAS_GEO;
                    a.last_geo_s = now_s;
                    a.last_lat = lat;
                    a.last_lon = lon;
                    a.best_rssi = a.last_rssi;
                    a.best_lat = lat;
                    a.best_lon = lon;
                    a.w_sum = 1.0;
                    a.w_lat = lat;
                    a.w_lon = lon;
                }
            }
            EntityKind::WifiClient | EntityKind::BleAdv => {
                let track_kind = if kind == EntityKind::WifiClient {
                    TrackKind::WifiClient
                } else {
                    TrackKind::BleAdv
                };
                let i = tables.find_or_alloc_track(track_kind, addr, now_s, 0)?;
                let t = tables.tracks[i].as_mut()?;
                t.flags |= FLAG_WATCHING;
                if let (Some(lat), Some(lon)) = (raw.lat, raw.lon) {
                    t.flags |= FLAG_HAS_GEO;
                    t.last_geo_s = now_s;
                    t.last_lat = lat;
                    t.last_lon = lon;
                }
                if let Some(tt) = &raw.tracker_type {
                    t.tracker_type = tracker_type_from_str(tt);
                }
                if let Some(gm) = &raw.tracker_google_mfr {
                    t.tracker_google_mfr = google_mfr_from_str(gm);
                }
                if let Some(st) = &raw.tracker_samsung_subtype {
                    t.tracker_samsung_subtype = samsung_subtype_from_str(st);
                }
                if let Some(c) = raw.tracker_confidence {
                    t.tracker_confidence = c;
                }
            }
        }
        Some(())
    })
}

/// Emits every Watching entity, anchors then tracks, up to
/// `MAX_WATCHLIST_ITEMS`; entities past the cap are skipped and counted,
/// matching the read side's skip/count behavior.
pub fn write_watchlist(tracker: &DeviceTracker) -> alloc::string::String {
    tracker.with_tables(|tables| {
        let mut out = alloc::string::String::new();
        let _ = write!(out, "{{\"version\":2,\"items\":[");
        let mut first = true;
        let mut emitted = 0usize;
        let mut skipped = 0u32;

        for a in tables.anchors.iter().flatten().filter(|a| a.flags & FLAG_WATCHING != 0) {
            if emitted >= MAX_WATCHLIST_ITEMS {
                skipped += 1;
                continue;
            }
            emitted += 1;
            if !first {
                let _ = write!(out, ",");
            }
            first = false;
            let _ = write!(out, "{{\"kind\":\"WifiAp\",\"mac\":\"{}\"", format_mac(&a.addr));
            if a.ssid_len > 0 {
                let _ = write!(out, ",\"ssid\":\"");
                push_json_escaped(&mut out, a.ssid_str());
                let _ = write!(out, "\"");
            }
            if a.flags & FLAG_HAS_GEO != 0 {
                let _ = write!(out, ",\"lat\":{:.8},\"lon\":{:.8}", a.last_lat, a.last_lon);
            }
            let _ = write!(out, "}}");
        }

        for t in tables.tracks.iter().flatten().filter(|t| t.flags & FLAG_WATCHING != 0) {
            if emitted >= MAX_WATCHLIST_ITEMS {
                skipped += 1;
                continue;
            }
            emitted += 1;
            if !first {
                let _ = write!(out, ",");
            }
            first = false;
            let kind_str = if t.kind == TrackKind::WifiClient { "WifiClient" } else { "BleAdv" };
            let _ = write!(out, "{{\"kind\":\"{kind_str}\",\"mac\":\"{}\"", format_mac(&t.addr));
            if t.flags & FLAG_HAS_GEO != 0 {
                let _ = write!(out, ",\"lat\":{:.8},\"lon\":{:.8}", t.last_lat, t.last_lon);
            }
            if let Some(s) = tracker_type_str(t.tracker_type) {
                let _ = write!(out, ",\"tracker_type\":\"{s}\"");
            }
            if let Some(s) = google_mfr_str(t.tracker_google_mfr) {
                let _ = write!(out, ",\"tracker_google_mfr\":\"{s}\"");
            }
            if let Some(s) = samsung_subtype_str(t.tracker_samsung_subtype) {
                let _ = write!(out, ",\"tracker_samsung_subtype\":\"{s}\"");
            }
            if t.tracker_confidence > 0 {
                let _ = write!(out, ",\"tracker_confidence\":{}", t.tracker_confidence);
            }
            let _ = write!(out, "}}");
        }

        let _ = write!(out, "]}}");
        if skipped > 0 {
            log::warn!("{} watched entities skipped writing watchlist (past the {} item cap)", skipped, MAX_WATCHLIST_ITEMS);
        }
        out
    })
}

fn kml_escape(s: &str, out: &mut alloc::string::String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
}

/// One `Placemark` per Watching entity that also has geo. Entities
/// without a fix contribute nothing.
pub fn write_watchlist_kml(tracker: &DeviceTracker) -> alloc::string::String {
    tracker.with_tables(|tables| {
        let mut out = alloc::string::String::new();
        let _ = write!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<kml xmlns=\"http://www.opengis.net/kml/2.2\"><Document>\n <name>PT Watchlist</name>\n"
        );

        for a in tables
            .anchors
            .iter()
            .flatten()
            .filter(|a| a.flags & FLAG_WATCHING != 0 && a.flags & FLAG_HAS_GEO != 0)
        {
            let mac = format_mac(&a.addr);
            let label = if a.ssid_len > 0 { a.ssid_str() } else { "Hidden AP" };
            let _ = write!(out, " <Placemark><name>");
            kml_escape(label, &mut out);
            let _ = write!(out, " ({mac})</name>\n <description>Kind: WifiAp&#10;MAC: {mac}");
            if a.ssid_len > 0 {
                let _ = write!(out, "&#10;SSID: ");
                kml_escape(a.ssid_str(), &mut out);
            }
            let _ = write!(
                out,
                "</description>\n <Point><coordinates>{:.8},{:.8},0</coordinates></Point></Placemark>\n",
                a.last_lon, a.last_lat
            );
        }

        for t in tables
            .tracks
            .iter()
            .flatten()
            .filter(|t| t.flags & FLAG_WATCHING != 0 && t.flags & FLAG_HAS_GEO != 0)
        {
            let mac = format_mac(&t.addr);
            let kind_str = if t.kind == TrackKind::WifiClient { "WifiClient" } else { "BleAdv" };
            let label = tracker_type_str(t.tracker_type).unwrap_or("BLE Device");
            let _ = write!(out, " <Placemark><name>{label} ({mac})</name>\n <description>Kind: {kind_str}&#10;MAC: {mac}");
            if let Some(s) = tracker_type_str(t.tracker_type) {
                let _ = write!(out, "&#10;TrackerType: {s}");
            }
            let _ = write!(
                out,
                "</description>\n <Point><coordinates>{:.8},{:.8},0</coordinates></Point></Placemark>\n",
                t.last_lon, t.last_lat
            );
        }

        let _ = write!(out, "</Document></kml>");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{Observation, ObservationKind};
    use crate::wids::{GoogleMfr, SamsungSubtype, TrackerType};

    #[test]
    fn mac_round_trips() {
        let addr = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        assert_eq!(format_mac(&addr).as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(parse_mac("AA:BB:CC:DD:EE:FF"), Some(addr));
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff"), Some(addr));
        assert_eq!(parse_mac("not-a-mac"), None);
    }

    #[test]
    fn malformed_document_fails_entirely() {
        let tracker = DeviceTracker::new();
        assert!(!read_watchlist("{not json", &tracker, 0));
        assert!(!read_watchlist("{\"version\":2}", &tracker, 0));
    }

    #[test]
    fn malformed_item_is_skipped_not_fatal() {
        let tracker = DeviceTracker::new();
        let doc = r#"{"version":2,"items":[{"kind":"Bogus","mac":"AA:BB:CC:DD:EE:FF"},{"kind":"WifiAp","mac":"11:22:33:44:55:66"}]}"#;
        assert!(read_watchlist(doc, &tracker, 0));
        let rows = tracker.build_snapshot(16, 0.0);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn watchlist_round_trip_preserves_geo() {
        let tracker = DeviceTracker::new();
        let doc = r#"{"version":2,"items":[{"kind":"WifiAp","mac":"AA:BB:CC:DD:EE:FF","lat":1.0,"lon":2.0}]}"#;
        assert!(read_watchlist(doc, &tracker, 0));

        let out = write_watchlist(&tracker);
        assert!(out.contains("\"kind\":\"WifiAp\""));
        assert!(out.contains("\"mac\":\"AA:BB:CC:DD:EE:FF\""));
        assert!(out.contains("\"lat\":1.00000000"));
        assert!(out.contains("\"lon\":2.00000000"));

        // Exactly one item.
        assert_eq!(out.matches("\"kind\"").count(), 1);
    }

    #[test]
    fn reset_then_readwatchlist_restores_watching_entities() {
        let tracker = DeviceTracker::new();
        let doc = r#"{"version":2,"items":[{"kind":"BleAdv","mac":"11:22:33:44:55:66","tracker_type":"AirTag","tracker_confidence":75}]}"#;
        assert!(read_watchlist(doc, &tracker, 0));
        let saved = write_watchlist(&tracker);

        tracker.reset();
        assert!(read_watchlist(&saved, &tracker, 0));

        let rows = tracker.build_snapshot(16, 0.0);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].watching());
        assert_eq!(rows[0].tracker_type, TrackerType::AppleAirTag);
    }

    #[test]
    fn over_cap_document_keeps_first_64_and_counts_the_rest() {
        let tracker = DeviceTracker::new();
        let mut doc = alloc::string::String::from(r#"{"version":2,"items":["#);
        for i in 0..70u32 {
            if i > 0 {
                doc.push(',');
            }
            let _ = write!(
                doc,
                r#"{{"kind":"WifiAp","mac":"AA:BB:CC:{:02X}:{:02X}:{:02X}"}}"#,
                (i >> 16) & 0xff,
                (i >> 8) & 0xff,
                i & 0xff
            );
        }
        doc.push_str("]}");

        assert!(read_watchlist(&doc, &tracker, 0));
        let rows = tracker.build_snapshot(MAX_WATCHLIST_ITEMS, 0.0);
        assert_eq!(rows.len(), MAX_WATCHLIST_ITEMS);
    }

    #[test]
    fn write_watchlist_caps_output_at_max_items() {
        let tracker = DeviceTracker::new();
        tracker.with_tables_mut(|tables| {
            for i in 0..(MAX_WATCHLIST_ITEMS + 10) {
                let addr = [0xAA, 0xBB, 0xCC, (i >> 16) as u8, (i >> 8) as u8, i as u8];
                let idx = tables.find_or_alloc_anchor(addr, 0).unwrap();
                tables.anchors[idx].as_mut().unwrap().flags |= FLAG_WATCHING;
            }
        });

        let out = write_watchlist(&tracker);
        assert_eq!(out.matches("\"kind\"").count(), MAX_WATCHLIST_ITEMS);
    }

    #[test]
    fn kml_contains_only_the_geo_tagged_watching_entity() {
        let tracker = DeviceTracker::new();
        let doc = r#"{"version":2,"items":[{"kind":"WifiAp","mac":"AA:BB:CC:DD:EE:FF","lat":1.0,"lon":2.0}]}"#;
        assert!(read_watchlist(doc, &tracker, 0));

        tracker.process_observation(Observation::ble(
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            -60,
            10,
            TrackerType::Unknown,
            GoogleMfr::Unknown,
            SamsungSubtype::Unknown,
            0,
        ));
        let idx = tracker
            .build_snapshot(16, 0.0)
            .iter()
            .find(|r| r.kind == EntityKind::BleAdv)
            .unwrap()
            .index;
        assert!(tracker.update_entity(EntityKind::BleAdv, idx, true));

        let kml = write_watchlist_kml(&tracker);
        assert_eq!(kml.matches("<Placemark>").count(), 1);
        assert!(kml.contains("<coordinates>2.00000000,1.00000000,0</coordinates>"));
    }
}
