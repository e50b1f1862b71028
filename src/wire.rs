//! Host/device wire protocol: NDJSON framing over serial and BLE GATT
//! notifications.
//!
//! Mirrors the shape of the reference firmware's line-oriented command
//! channel: a byte-at-a-time [`LineReader`] accumulates newline-delimited
//! JSON from either transport, [`parse_command`] turns a line into a
//! [`HostCommand`], and the `serialize_*` functions hand-write NDJSON rows
//! into a caller-supplied buffer — no heap allocation, matching the ISR-safe
//! discipline the radio callbacks need upstream of this module.

use core::fmt::Write as _;

use serde::Deserialize;

use crate::export::{format_mac, google_mfr_str, parse_kind, samsung_subtype_str, tracker_type_str};
use crate::tracker::{EntityKind, EntityView};
use crate::wids::vendor_str;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// BLE GATT service UUIDs.
///
/// Proc macros require string literals, so these duplicate the
/// `#[gatt_service]`/`#[characteristic]` attributes in the firmware binary;
/// kept here as the canonical source of truth.
#[allow(dead_code)]
pub mod ble_uuids {
    pub const SERVICE: &str = "7a1e0001-2c9b-4a3e-9d4f-6b8e3c7d0a11";
    pub const TX_CHAR: &str = "7a1e0002-2c9b-4a3e-9d4f-6b8e3c7d0a11";
    pub const RX_CHAR: &str = "7a1e0003-2c9b-4a3e-9d4f-6b8e3c7d0a11";
}

/// BLE advertising name.
pub const BLE_ADV_NAME: &str = "ProxTrack";
/// Maximum BLE notification payload (MTU-3 for the default 23-byte MTU).
pub const BLE_MAX_NOTIFY: usize = 20;
/// Largest line either transport will accumulate. Sized for a `watchlist_set`
/// command carrying the full watchlist document inline.
pub const MAX_MSG_LEN: usize = 2048;

/// Largest single outbound status/entity line. Watchlist/KML documents are
/// larger than this and get split across several channel sends instead (the
/// host's NDJSON reader accumulates until it sees a newline regardless of
/// how many transport fragments it arrived in).
pub const MAX_OUT_LINE_LEN: usize = 400;

// ── Host -> device commands ─────────────────────────────────────────────

/// A parsed host command.
#[derive(Debug, Clone)]
pub enum HostCommand {
    Start,
    Stop,
    GetStatus,
    SetGpsFix {
        lat: f64,
        lon: f64,
        sats: u8,
        speed: f32,
        course: f32,
        altitude: f32,
    },
    SetWatch {
        kind: EntityKind,
        index: u16,
        watching: bool,
    },
    WatchlistGet,
    WatchlistGetKml,
    WatchlistSet {
        json: heapless::String<MAX_MSG_LEN>,
    },
}

/// Intermediate deserialization target. `serde_json_core` has no
/// `deserialize_any`, so internally tagged enums aren't supported — `cmd` is
/// read as a string and matched by hand (the same workaround the watchlist
/// reader in `export.rs` uses for its `kind` field).
#[derive(Debug, Deserialize)]
struct RawCommand {
    cmd: heapless::String<24>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    sats: Option<u8>,
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    course: Option<f32>,
    #[serde(default)]
    altitude: Option<f32>,
    #[serde(default)]
    kind: Option<heapless::String<16>>,
    #[serde(default)]
    index: Option<u16>,
    #[serde(default)]
    watching: Option<bool>,
    // Owned (not borrowed): the embedded watchlist document is itself
    // escaped JSON, and serde_json_core's zero-copy `&str` path rejects
    // escape sequences — only the owned path unescapes into this buffer.
    #[serde(default)]
    watchlist: Option<heapless::String<MAX_MSG_LEN>>,
}

/// Parse a `HostCommand` from a line of bytes (no trailing newline required).
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let text = core::str::from_utf8(trimmed).ok()?;
    let (raw, _) = serde_json_core::from_str::<RawCommand>(text).ok()?;

    match raw.cmd.as_str() {
        "start" => Some(HostCommand::Start),
        "stop" => Some(HostCommand::Stop),
        "status" => Some(HostCommand::GetStatus),
        "set_gps_fix" => Some(HostCommand::SetGpsFix {
            lat: raw.lat?,
            lon: raw.lon?,
            sats: raw.sats.unwrap_or(0),
            speed: raw.speed.unwrap_or(0.0),
            course: raw.course.unwrap_or(0.0),
            altitude: raw.altitude.unwrap_or(0.0),
        }),
        "set_watch" => Some(HostCommand::SetWatch {
            kind: parse_kind(raw.kind.as_deref()?)?,
            index: raw.index?,
            watching: raw.watching?,
        }),
        "watchlist_get" => Some(HostCommand::WatchlistGet),
        "watchlist_get_kml" => Some(HostCommand::WatchlistGetKml),
        "watchlist_set" => Some(HostCommand::WatchlistSet {
            json: raw.watchlist?,
        }),
        _ => None,
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0
        && (data[end - 1] == b' '
            || data[end - 1] == b'\n'
            || data[end - 1] == b'\r'
            || data[end - 1] == b'\t')
    {
        end -= 1;
    }
    &data[..end]
}

// ── Device -> host output ───────────────────────────────────────────────

/// Live counters surfaced in the periodic status line and in reply to
/// `{"cmd":"status"}`.
pub struct StatusInfo {
    pub scanning: bool,
    pub uptime_s: u32,
    pub heap_free: u32,
    pub ble_clients: u8,
    pub board: &'static str,
    pub segment_id: u32,
    pub move_segments: u32,
    pub queue_dropped: u32,
    pub allocation_saturations: u32,
}

/// Write a `{"type":"status",...}` NDJSON line into `buf`. Returns the byte
/// count written (including the trailing newline), or `None` if it doesn't
/// fit.
pub fn serialize_status(info: &StatusInfo, buf: &mut [u8]) -> Option<usize> {
    let mut s: heapless::String<256> = heapless::String::new();
    write!(
        s,
        "{{\"type\":\"status\",\"scanning\":{},\"uptime_s\":{},\"heap_free\":{},\
         \"ble_clients\":{},\"board\":\"{}\",\"version\":\"{}\",\"segment_id\":{},\
         \"move_segments\":{},\"queue_dropped\":{},\"allocation_saturations\":{}}}\n",
        info.scanning,
        info.uptime_s,
        info.heap_free,
        info.ble_clients,
        info.board,
        VERSION,
        info.segment_id,
        info.move_segments,
        info.queue_dropped,
        info.allocation_saturations,
    )
    .ok()?;
    copy_into(s.as_bytes(), buf)
}

/// Write a `{"type":"entity",...}` NDJSON line describing one snapshot row.
pub fn serialize_entity_row(view: &EntityView, buf: &mut [u8]) -> Option<usize> {
    let mut s: heapless::String<MAX_MSG_LEN> = heapless::String::new();
    let kind_str = match view.kind {
        EntityKind::WifiAp => "wifi_ap",
        EntityKind::WifiClient => "wifi_client",
        EntityKind::BleAdv => "ble_adv",
    };
    let mac = format_mac(&view.addr);

    write!(
        s,
        "{{\"type\":\"entity\",\"kind\":\"{}\",\"index\":{},\"mac\":\"{}\",\"vendor\":\"",
        kind_str, view.index, mac,
    )
    .ok()?;
    push_json_escaped(&mut s, vendor_str(view.vendor));
    s.push_str("\",").ok()?;

    if view.kind == EntityKind::WifiAp {
        s.push_str("\"ssid\":\"").ok()?;
        push_json_escaped(&mut s, view.ssid_str());
        s.push_str("\",").ok()?;
    }

    write!(
        s,
        "\"rssi\":{},\"score\":{:.1},\"first_seen_s\":{},\"last_seen_s\":{},\"watching\":{}",
        view.rssi,
        view.score,
        view.first_seen_s,
        view.last_seen_s,
        view.watching(),
    )
    .ok()?;

    if view.has_geo() {
        write!(s, ",\"lat\":{:.8},\"lon\":{:.8}", view.lat, view.lon).ok()?;
    }
    if let Some(t) = tracker_type_str(view.tracker_type) {
        write!(s, ",\"tracker_type\":\"{}\"", t).ok()?;
    }
    if let Some(m) = google_mfr_str(view.tracker_google_mfr) {
        write!(s, ",\"tracker_google_mfr\":\"{}\"", m).ok()?;
    }
    if let Some(st) = samsung_subtype_str(view.tracker_samsung_subtype) {
        write!(s, ",\"tracker_samsung_subtype\":\"{}\"", st).ok()?;
    }
    if view.tracker_confidence > 0 {
        write!(s, ",\"tracker_confidence\":{}", view.tracker_confidence).ok()?;
    }
    s.push_str("}\n").ok()?;

    copy_into(s.as_bytes(), buf)
}

/// Escapes `text` into `dst` for embedding inside a JSON string literal —
/// quote/backslash plus raw control bytes (e.g. a BSSID broadcasting an
/// SSID containing `0x0A`), which are valid UTF-8 but invalid unescaped in
/// JSON per RFC 8259. Shared with `export.rs`'s watchlist writers so every
/// JSON string field in the crate goes through the same escaping.
pub(crate) fn push_json_escaped(dst: &mut impl core::fmt::Write, text: &str) {
    for c in text.chars() {
        match c {
            '"' => {
                let _ = dst.write_str("\\\"");
            }
            '\\' => {
                let _ = dst.write_str("\\\\");
            }
            '\n' => {
                let _ = dst.write_str("\\n");
            }
            '\r' => {
                let _ = dst.write_str("\\r");
            }
            '\t' => {
                let _ = dst.write_str("\\t");
            }
            c if (c as u32) < 0x20 => {
                let _ = write!(dst, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = dst.write_char(c);
            }
        }
    }
}

fn copy_into(bytes: &[u8], buf: &mut [u8]) -> Option<usize> {
    if bytes.len() > buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    Some(bytes.len())
}

/// Serial/BLE line reader state machine. Accumulates bytes until a newline
/// is found, then yields the line (without the newline).
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
        }
    }

    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            self.pos = 0;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::EntityKind;
    use crate::wids::{GoogleMfr, SamsungSubtype, TrackerType, Vendor};

    #[test]
    fn parse_start_stop_status() {
        assert!(matches!(
            parse_command(br#"{"cmd":"start"}"#),
            Some(HostCommand::Start)
        ));
        assert!(matches!(
            parse_command(br#"{"cmd":"stop"}"#),
            Some(HostCommand::Stop)
        ));
        assert!(matches!(
            parse_command(br#"{"cmd":"status"}"#),
            Some(HostCommand::GetStatus)
        ));
    }

    #[test]
    fn parse_set_gps_fix() {
        let cmd = parse_command(
            br#"{"cmd":"set_gps_fix","lat":37.7749,"lon":-122.4194,"sats":9}"#,
        )
        .unwrap();
        match cmd {
            HostCommand::SetGpsFix { lat, lon, sats, .. } => {
                assert!((lat - 37.7749).abs() < 1e-9);
                assert!((lon + 122.4194).abs() < 1e-9);
                assert_eq!(sats, 9);
            }
            _ => panic!("expected SetGpsFix"),
        }
    }

    #[test]
    fn parse_set_watch() {
        let cmd = parse_command(
            br#"{"cmd":"set_watch","kind":"BleAdv","index":3,"watching":true}"#,
        )
        .unwrap();
        match cmd {
            HostCommand::SetWatch {
                kind,
                index,
                watching,
            } => {
                assert_eq!(kind, EntityKind::BleAdv);
                assert_eq!(index, 3);
                assert!(watching);
            }
            _ => panic!("expected SetWatch"),
        }
    }

    #[test]
    fn parse_watchlist_set_carries_payload() {
        let line = br#"{"cmd":"watchlist_set","watchlist":"{\"version\":2,\"items\":[]}"}"#;
        let cmd = parse_command(line).unwrap();
        match cmd {
            HostCommand::WatchlistSet { json } => {
                assert!(json.contains("\"version\":2"));
            }
            _ => panic!("expected WatchlistSet"),
        }
    }

    #[test]
    fn parse_watchlist_get_variants() {
        assert!(matches!(
            parse_command(br#"{"cmd":"watchlist_get"}"#),
            Some(HostCommand::WatchlistGet)
        ));
        assert!(matches!(
            parse_command(br#"{"cmd":"watchlist_get_kml"}"#),
            Some(HostCommand::WatchlistGetKml)
        ));
    }

    #[test]
    fn parse_rejects_malformed_and_empty() {
        assert!(parse_command(b"not json").is_none());
        assert!(parse_command(b"").is_none());
        assert!(parse_command(b"  \n").is_none());
    }

    #[test]
    fn serialize_status_is_ndjson() {
        let info = StatusInfo {
            scanning: true,
            uptime_s: 120,
            heap_free: 50_000,
            ble_clients: 1,
            board: "xiao_esp32s3",
            segment_id: 2,
            move_segments: 1,
            queue_dropped: 0,
            allocation_saturations: 0,
        };
        let mut buf = [0u8; 512];
        let len = serialize_status(&info, &mut buf).unwrap();
        assert_eq!(buf[len - 1], b'\n');
        let json = core::str::from_utf8(&buf[..len - 1]).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        assert!(json.contains("\"type\":\"status\""));
    }

    #[test]
    fn serialize_entity_row_includes_geo_only_when_present() {
        let view = EntityView {
            kind: EntityKind::BleAdv,
            index: 7,
            addr: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
            vendor: Vendor::Apple,
            ssid: [0; 32],
            ssid_len: 0,
            rssi: -60,
            score: 42.5,
            first_seen_s: 10,
            last_seen_s: 20,
            flags: 0,
            lat: 0.0,
            lon: 0.0,
            tracker_type: TrackerType::AppleAirTag,
            tracker_google_mfr: GoogleMfr::Unknown,
            tracker_samsung_subtype: SamsungSubtype::Unknown,
            tracker_confidence: 90,
        };
        let mut buf = [0u8; 512];
        let len = serialize_entity_row(&view, &mut buf).unwrap();
        let json = core::str::from_utf8(&buf[..len - 1]).unwrap();
        assert!(!json.contains("\"lat\""));
        assert!(json.contains("\"tracker_type\":\"AirTag\""));
        assert!(json.contains("\"tracker_confidence\":90"));
    }

    #[test]
    fn line_reader_yields_on_newline() {
        let mut reader = LineReader::new();
        assert!(reader.feed(b'h').is_none());
        assert!(reader.feed(b'i').is_none());
        assert_eq!(reader.feed(b'\n').unwrap(), b"hi");
    }

    #[test]
    fn line_reader_skips_empty_lines() {
        let mut reader = LineReader::new();
        assert!(reader.feed(b'\n').is_none());
        assert!(reader.feed(b'\r').is_none());
    }
}
