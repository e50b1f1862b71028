//! Entity Tables, Segmentation Engine, Scoring Engine, Snapshot Builder, and
//! the `DeviceTracker` facade that ties them — together with the
//! Observation Queue (`channel.rs`) and GNSS snapshot (`gps.rs`) — into a
//! single owned object: the host's statics become fields of one struct
//! instead of file-scope globals.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::channel::ObservationQueue;
use crate::gps::{GnssFix, GnssSnapshot};
use crate::observation::{Observation, ObservationKind};
use crate::wids::{self, GoogleMfr, SamsungSubtype, TrackerType, Vendor};

// ── Tuning constants ──────────────────────────────────────────────────

pub const WINDOW_SEC: u32 = 10;
pub const ENV_WINDOW_SEC: u32 = 30;
pub const MAX_TRACKS: usize = 256;
pub const MAX_ANCHORS: usize = 128;
pub const FP_TOP_N: usize = 8;
pub const RSSI_NEAR_DBM: i8 = -65;
pub const RSSI_MID_DBM: i8 = -80;
pub const T_CAP_MIN: f32 = 30.0;
pub const RSSI_DEV_CAP: f32 = 10.0;
pub const CROWD_LO: f32 = 5.0;
pub const CROWD_HI: f32 = 40.0;
pub const FP_SIMILARITY_MIN: f32 = 0.50;
pub const TRACK_IDLE_SEC_WIFI: u32 = 900;
pub const TRACK_IDLE_SEC_BLE: u32 = 1200;
pub const ANCHOR_IDLE_SEC: u32 = 600;
pub const GNSS_SEGMENT_DISTANCE_M: f64 = 50.0;
pub const GNSS_SEGMENT_MIN_PERIOD_S: u32 = 10;
pub const FP_LOOKBACK_S: u32 = 60;
/// Recommended range is 64-256; the midpoint is used here.
pub const QUEUE_CAPACITY: usize = 128;

const SNAPSHOT_CAP: usize = MAX_TRACKS + MAX_ANCHORS;

// ── Flags ────────────────────────────────────────────────────────────────

pub const FLAG_HAS_GEO: u8 = 0b01;
pub const FLAG_WATCHING: u8 = 0b10;

// ── Data model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    WifiClient,
    BleAdv,
}

/// Closed sum type used by `EntityView`/the watchlist document/`updateEntity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    WifiClient,
    BleAdv,
    WifiAp,
}

#[derive(Debug, Clone, Copy)]
pub struct Track {
    pub kind: TrackKind,
    pub addr: [u8; 6],
    pub vendor: Vendor,
    pub flags: u8,
    pub index: u16,
    pub first_seen_s: u32,
    pub last_seen_s: u32,
    pub last_window: u32,
    pub seen_windows: u32,
    pub near_windows: u32,
    pub ema_rssi: f32,
    pub ema_abs_dev: f32,
    pub last_segment_id: u32,
    pub env_hits: u32,
    pub crowd_ema: f32,
    pub last_geo_s: u32,
    pub last_lat: f64,
    pub last_lon: f64,
    pub tracker_type: TrackerType,
    pub tracker_google_mfr: GoogleMfr,
    pub tracker_samsung_subtype: SamsungSubtype,
    pub tracker_confidence: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub addr: [u8; 6],
    pub vendor: Vendor,
    pub flags: u8,
    pub ssid: [u8; 32],
    pub ssid_len: u8,
    pub index: u16,
    pub last_rssi: i8,
    pub last_seen_s: u32,
    pub last_geo_s: u32,
    pub last_lat: f64,
    pub last_lon: f64,
    pub best_rssi: i8,
    pub best_lat: f64,
    pub best_lon: f64,
    pub w_sum: f64,
    pub w_lat: f64,
    pub w_lon: f64,
}

impl Anchor {
    pub fn ssid_str(&self) -> &str {
        core::str::from_utf8(&self.ssid[..self.ssid_len as usize]).unwrap_or("")
    }
}

/// Up to [`FP_TOP_N`] (address, rssi-bucket) pairs describing the current
/// RF environment, used by the fingerprint segmentation mode.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvFingerprint {
    pub items: heapless::Vec<([u8; 6], u8), FP_TOP_N>,
}

impl EnvFingerprint {
    pub fn empty() -> Self {
        Self {
            items: heapless::Vec::new(),
        }
    }
}

fn rssi_bucket(rssi: i8) -> u8 {
    if rssi >= RSSI_NEAR_DBM {
        2
    } else if rssi >= RSSI_MID_DBM {
        1
    } else {
        0
    }
}

/// Read-only projection of a Track or Anchor for UI/export consumers.
#[derive(Debug, Clone, Copy)]
pub struct EntityView {
    pub kind: EntityKind,
    pub index: u16,
    pub addr: [u8; 6],
    pub vendor: Vendor,
    pub ssid: [u8; 32],
    pub ssid_len: u8,
    pub rssi: i8,
    pub score: f32,
    pub first_seen_s: u32,
    pub last_seen_s: u32,
    pub flags: u8,
    pub lat: f64,
    pub lon: f64,
    pub tracker_type: TrackerType,
    pub tracker_google_mfr: GoogleMfr,
    pub tracker_samsung_subtype: SamsungSubtype,
    pub tracker_confidence: u8,
}

impl EntityView {
    pub fn has_geo(&self) -> bool {
        self.flags & FLAG_HAS_GEO != 0
    }

    pub fn watching(&self) -> bool {
        self.flags & FLAG_WATCHING != 0
    }

    pub fn ssid_str(&self) -> &str {
        core::str::from_utf8(&self.ssid[..self.ssid_len as usize]).unwrap_or("")
    }
}

fn clamp01(x: f32) -> f32 {
    if x < 0.0 {
        0.0
    } else if x > 1.0 {
        1.0
    } else {
        x
    }
}

fn clampf(x: f32, lo: f32, hi: f32) -> f32 {
    if x < lo {
        lo
    } else if x > hi {
        hi
    } else {
        x
    }
}

/// Pure scoring function. `move_segments` comes from the segmentation
/// engine, since it is not stored on the Track itself.
pub fn score(t: &Track, move_segments: u32, stationary_ratio: f32) -> f32 {
    let t_min = (t.last_seen_s.saturating_sub(t.first_seen_s)) as f32 / 60.0;
    let p = 30.0 * clamp01(libm::logf(1.0 + t_min) / libm::logf(1.0 + T_CAP_MIN));

    let f_near = if t.seen_windows > 0 {
        t.near_windows as f32 / t.seen_windows as f32
    } else {
        0.0
    };
    let stability = clamp01(1.0 - t.ema_abs_dev / RSSI_DEV_CAP);
    let r = 25.0 * clamp01(0.7 * f_near + 0.3 * stability);

    let denom = move_segments.max(1);
    let m = 35.0 * clamp01(t.env_hits as f32 / denom as f32);

    let c = -25.0 * clamp01((t.crowd_ema - CROWD_LO) / (CROWD_HI - CROWD_LO));
    let i = -20.0 * clamp01(stationary_ratio);

    clampf(p + r + m + c + i, 0.0, 100.0)
}

// ── Entity Tables ────────────────────────────────────────────────────────

pub struct EntityTables {
    pub tracks: [Option<Track>; MAX_TRACKS],
    pub anchors: [Option<Anchor>; MAX_ANCHORS],
    pub next_index: u16,
}

impl EntityTables {
    pub const fn new() -> Self {
        Self {
            tracks: [None; MAX_TRACKS],
            anchors: [None; MAX_ANCHORS],
            next_index: 1,
        }
    }

    fn alloc_index(&mut self) -> u16 {
        let idx = self.next_index;
        self.next_index = self.next_index.wrapping_add(1).max(1);
        idx
    }

    /// Returns the slot index, or `None` if the table is full of watched
    /// entries.
    pub fn find_or_alloc_track(
        &mut self,
        kind: TrackKind,
        addr: [u8; 6],
        ts_s: u32,
        current_segment: u32,
    ) -> Option<usize> {
        for i in 0..MAX_TRACKS {
            if let Some(t) = &self.tracks[i] {
                if t.kind == kind && t.addr == addr {
                    return Some(i);
                }
            }
        }
        for i in 0..MAX_TRACKS {
            if self.tracks[i].is_none() {
                self.init_track(i, kind, addr, ts_s, current_segment);
                return Some(i);
            }
        }
        let evict = (0..MAX_TRACKS)
            .filter_map(|i| self.tracks[i].map(|t| (i, t)))
            .filter(|(_, t)| t.flags & FLAG_WATCHING == 0)
            .min_by_key(|(_, t)| t.last_seen_s)
            .map(|(i, _)| i);
        if let Some(i) = evict {
            self.init_track(i, kind, addr, ts_s, current_segment);
            Some(i)
        } else {
            None
        }
    }

    fn init_track(&mut self, i: usize, kind: TrackKind, addr: [u8; 6], ts_s: u32, current_segment: u32) {
        let index = self.alloc_index();
        self.tracks[i] = Some(Track {
            kind,
            addr,
            vendor: wids::vendor_for_mac(&addr),
            flags: 0,
            index,
            first_seen_s: ts_s,
            last_seen_s: ts_s,
            last_window: ts_s / WINDOW_SEC,
            seen_windows: 0,
            near_windows: 0,
            ema_rssi: -100.0,
            ema_abs_dev: 0.0,
            last_segment_id: current_segment,
            env_hits: 1,
            crowd_ema: 0.0,
            last_geo_s: 0,
            last_lat: 0.0,
            last_lon: 0.0,
            tracker_type: TrackerType::Unknown,
            tracker_google_mfr: GoogleMfr::Unknown,
            tracker_samsung_subtype: SamsungSubtype::Unknown,
            tracker_confidence: 0,
        });
    }

    /// Returns the slot index, or `None` if the table is full of watched
    /// entries.
    pub fn find_or_alloc_anchor(&mut self, addr: [u8; 6], ts_s: u32) -> Option<usize> {
        for i in 0..MAX_ANCHORS {
            if let Some(a) = &self.anchors[i] {
                if a.addr == addr {
                    return Some(i);
                }
            }
        }
        for i in 0..MAX_ANCHORS {
            if self.anchors[i].is_none() {
                self.init_anchor(i, addr, ts_s);
                return Some(i);
            }
        }
        let evict = (0..MAX_ANCHORS)
            .filter_map(|i| self.anchors[i].map(|a| (i, a)))
            .filter(|(_, a)| a.flags & FLAG_WATCHING == 0)
            .min_by_key(|(_, a)| a.last_seen_s)
            .map(|(i, _)| i);
        if let Some(i) = evict {
            self.init_anchor(i, addr, ts_s);
            Some(i)
        } else {
            None
        }
    }

    fn init_anchor(&mut self, i: usize, addr: [u8; 6], ts_s: u32) {
        let index = self.alloc_index();
        self.anchors[i] = Some(Anchor {
            addr,
            vendor: wids::vendor_for_mac(&addr),
            flags: 0,
            ssid: [0u8; 32],
            ssid_len: 0,
            index,
            last_rssi: -127,
            last_seen_s: ts_s,
            last_geo_s: 0,
            last_lat: 0.0,
            last_lon: 0.0,
            best_rssi: -127,
            best_lat: 0.0,
            best_lon: 0.0,
            w_sum: 0.0,
            w_lat: 0.0,
            w_lon: 0.0,
        });
    }

    pub fn update_track_from_obs(
        &mut self,
        i: usize,
        rssi: i8,
        ts_s: u32,
        current_segment: u32,
        window_unique_hits: u32,
    ) {
        let Some(t) = self.tracks[i].as_mut() else {
            return;
        };
        t.last_seen_s = ts_s;

        let window = ts_s / WINDOW_SEC;
        if window != t.last_window {
            t.seen_windows += 1;
            if rssi >= RSSI_NEAR_DBM {
                t.near_windows += 1;
            }
            t.crowd_ema = 0.9 * t.crowd_ema + 0.1 * (window_unique_hits as f32);
            t.last_window = window;
        }

        let prev = t.ema_rssi;
        t.ema_rssi = 0.8 * prev + 0.2 * (rssi as f32);
        t.ema_abs_dev = 0.8 * t.ema_abs_dev + 0.2 * (rssi as f32 - prev).abs();

        if current_segment != t.last_segment_id {
            t.env_hits += 1;
            t.last_segment_id = current_segment;
        }
    }

    pub fn expire_tables(&mut self, ts_s: u32) {
        for slot in self.tracks.iter_mut() {
            if let Some(t) = slot {
                if t.flags & FLAG_WATCHING == 0 {
                    let idle = ts_s.saturating_sub(t.last_seen_s);
                    let threshold = match t.kind {
                        TrackKind::WifiClient => TRACK_IDLE_SEC_WIFI,
                        TrackKind::BleAdv => TRACK_IDLE_SEC_BLE,
                    };
                    if idle > threshold {
                        *slot = None;
                    }
                }
            }
        }
        for slot in self.anchors.iter_mut() {
            if let Some(a) = slot {
                if a.flags & FLAG_WATCHING == 0 {
                    let idle = ts_s.saturating_sub(a.last_seen_s);
                    if idle > ANCHOR_IDLE_SEC {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Clears non-watched slots, recomputes `next_index`.
    pub fn reset(&mut self) {
        for slot in self.tracks.iter_mut() {
            if let Some(t) = slot {
                if t.flags & FLAG_WATCHING == 0 {
                    *slot = None;
                }
            }
        }
        for slot in self.anchors.iter_mut() {
            if let Some(a) = slot {
                if a.flags & FLAG_WATCHING == 0 {
                    *slot = None;
                }
            }
        }
        let mut max_index = 0u16;
        for t in self.tracks.iter().flatten() {
            max_index = max_index.max(t.index);
        }
        for a in self.anchors.iter().flatten() {
            max_index = max_index.max(a.index);
        }
        self.next_index = max_index + 1;
    }
}

impl Default for EntityTables {
    fn default() -> Self {
        Self::new()
    }
}

// ── Segmentation Engine ──────────────────────────────────────────────────

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6_371_000.0;
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = libm::sin(dphi / 2.0) * libm::sin(dphi / 2.0)
        + libm::cos(phi1) * libm::cos(phi2) * libm::sin(dlambda / 2.0) * libm::sin(dlambda / 2.0);
    let c = 2.0 * libm::atan2(libm::sqrt(a), libm::sqrt(1.0 - a));
    R * c
}

fn jaccard_similarity(a: &EnvFingerprint, b: &EnvFingerprint) -> f32 {
    let union_count = {
        let mut addrs: heapless::Vec<[u8; 6], { FP_TOP_N * 2 }> = heapless::Vec::new();
        for (addr, _) in a.items.iter().chain(b.items.iter()) {
            if !addrs.contains(addr) {
                let _ = addrs.push(*addr);
            }
        }
        addrs.len()
    };
    if union_count == 0 {
        return 1.0;
    }
    let intersection_count = a
        .items
        .iter()
        .filter(|(addr, _)| b.items.iter().any(|(baddr, _)| baddr == addr))
        .count();
    let bonus_count = a
        .items
        .iter()
        .filter(|(addr, bucket)| b.items.iter().any(|(baddr, bbucket)| baddr == addr && bbucket == bucket))
        .count();
    let j = intersection_count as f32 / union_count as f32;
    let bonus = 0.25 * bonus_count as f32;
    j + bonus / union_count as f32
}

pub struct SegmentationEngine {
    pub segment_id: u32,
    pub move_segments: u32,
    pub last_env_tick_s: u32,
    gnss_anchor: Option<(f64, f64)>,
    last_gnss_eval_s: u32,
    last_fp_tick_s: u32,
    prev_fingerprint: Option<EnvFingerprint>,
}

impl SegmentationEngine {
    pub const fn new() -> Self {
        Self {
            segment_id: 0,
            move_segments: 0,
            last_env_tick_s: 0,
            gnss_anchor: None,
            last_gnss_eval_s: 0,
            last_fp_tick_s: 0,
            prev_fingerprint: None,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Clears the GNSS-mode anchor — called when a fix goes invalid.
    pub fn clear_gnss_anchor(&mut self) {
        self.gnss_anchor = None;
    }

    /// `anchors` is the anchor table, used to build the fingerprint when
    /// no GNSS fix is available.
    pub fn advance(&mut self, gnss: GnssFix, anchors: &[Option<Anchor>; MAX_ANCHORS], now_s: u32) {
        if gnss.valid {
            self.advance_gnss(gnss, now_s);
        } else {
            self.advance_fingerprint(anchors, now_s);
        }
        self.last_env_tick_s = now_s;
    }

    fn advance_gnss(&mut self, gnss: GnssFix, now_s: u32) {
        match self.gnss_anchor {
            None => {
                self.gnss_anchor = Some((gnss.lat, gnss.lon));
                self.last_gnss_eval_s = now_s;
            }
            Some((alat, alon)) => {
                if now_s.saturating_sub(self.last_gnss_eval_s) >= GNSS_SEGMENT_MIN_PERIOD_S {
                    let dist = haversine_m(alat, alon, gnss.lat, gnss.lon);
                    if dist >= GNSS_SEGMENT_DISTANCE_M {
                        self.segment_id += 1;
                        self.move_segments += 1;
                        self.gnss_anchor = Some((gnss.lat, gnss.lon));
                    }
                    self.last_gnss_eval_s = now_s;
                }
            }
        }
    }

    fn advance_fingerprint(&mut self, anchors: &[Option<Anchor>; MAX_ANCHORS], now_s: u32) {
        if now_s.saturating_sub(self.last_fp_tick_s) < ENV_WINDOW_SEC && self.last_fp_tick_s != 0 {
            return;
        }
        self.last_fp_tick_s = now_s;

        let mut candidates: heapless::Vec<(i8, [u8; 6]), MAX_ANCHORS> = heapless::Vec::new();
        for a in anchors.iter().flatten() {
            if now_s.saturating_sub(a.last_seen_s) <= FP_LOOKBACK_S {
                let _ = candidates.push((a.last_rssi, a.addr));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut fp = EnvFingerprint::empty();
        for (rssi, addr) in candidates.iter().take(FP_TOP_N) {
            let _ = fp.items.push((*addr, rssi_bucket(*rssi)));
        }

        if let Some(prev) = &self.prev_fingerprint {
            let sim = jaccard_similarity(prev, &fp);
            if sim < FP_SIMILARITY_MIN {
                self.segment_id += 1;
                self.move_segments += 1;
            }
        }
        self.prev_fingerprint = Some(fp);
    }
}

impl Default for SegmentationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Snapshot Builder ──────────────────────────────────────────────────────

pub fn build_snapshot(
    tables: &EntityTables,
    move_segments: u32,
    stationary_ratio: f32,
    max_out: usize,
) -> heapless::Vec<EntityView, SNAPSHOT_CAP> {
    let mut rows: heapless::Vec<EntityView, SNAPSHOT_CAP> = heapless::Vec::new();

    for t in tables.tracks.iter().flatten() {
        let kind = match t.kind {
            TrackKind::WifiClient => EntityKind::WifiClient,
            TrackKind::BleAdv => EntityKind::BleAdv,
        };
        let _ = rows.push(EntityView {
            kind,
            index: t.index,
            addr: t.addr,
            vendor: t.vendor,
            ssid: [0u8; 32],
            ssid_len: 0,
            rssi: libm::roundf(t.ema_rssi) as i8,
            score: score(t, move_segments, stationary_ratio),
            first_seen_s: t.first_seen_s,
            last_seen_s: t.last_seen_s,
            flags: t.flags,
            lat: t.last_lat,
            lon: t.last_lon,
            tracker_type: t.tracker_type,
            tracker_google_mfr: t.tracker_google_mfr,
            tracker_samsung_subtype: t.tracker_samsung_subtype,
            tracker_confidence: t.tracker_confidence,
        });
    }

    for a in tables.anchors.iter().flatten() {
        let (lat, lon) = if a.w_sum >= 3.0 {
            (a.w_lat / a.w_sum, a.w_lon / a.w_sum)
        } else {
            (a.best_lat, a.best_lon)
        };
        let _ = rows.push(EntityView {
            kind: EntityKind::WifiAp,
            index: a.index,
            addr: a.addr,
            vendor: a.vendor,
            ssid: a.ssid,
            ssid_len: a.ssid_len,
            rssi: a.last_rssi,
            score: 0.0,
            first_seen_s: a.last_seen_s,
            last_seen_s: a.last_seen_s,
            flags: a.flags,
            lat,
            lon,
            tracker_type: TrackerType::Unknown,
            tracker_google_mfr: GoogleMfr::Unknown,
            tracker_samsung_subtype: SamsungSubtype::Unknown,
            tracker_confidence: 0,
        });
    }

    rows.sort_by(|a, b| {
        b.watching()
            .cmp(&a.watching())
            .then(b.score.total_cmp(&a.score))
            .then(b.rssi.cmp(&a.rssi))
            .then(a.index.cmp(&b.index))
    });
    rows.truncate(max_out);
    rows
}

// ── DeviceTracker facade ──────────────────────────────────────────────────

struct Inner {
    tables: EntityTables,
    seg: SegmentationEngine,
    current_window: u32,
    window_unique_hits: u32,
}

impl Inner {
    const fn new() -> Self {
        Self {
            tables: EntityTables::new(),
            seg: SegmentationEngine::new(),
            current_window: 0,
            window_unique_hits: 0,
        }
    }
}

/// The owned device tracker: queue, tables, segmentation state, and GNSS
/// snapshot all live inside this one object — no file-scope globals.
pub struct DeviceTracker {
    queue: ObservationQueue<QUEUE_CAPACITY>,
    gnss: GnssSnapshot,
    inner: Mutex<RefCell<Inner>>,
    allocation_saturations: Mutex<RefCell<u32>>,
}

impl DeviceTracker {
    pub const fn new() -> Self {
        Self {
            queue: ObservationQueue::new(),
            gnss: GnssSnapshot::new(),
            inner: Mutex::new(RefCell::new(Inner::new())),
            allocation_saturations: Mutex::new(RefCell::new(0)),
        }
    }

    /// Queue creation cannot fail for the fixed-size inline queue used
    /// here; the `Result` is kept for interface parity with a future
    /// allocator-backed queue.
    pub fn begin(&mut self) -> Result<(), ()> {
        log::info!("device tracker starting");
        Ok(())
    }

    /// Non-blocking enqueue for radio callback contexts.
    pub fn enqueue(&self, obs: Observation) -> bool {
        let ok = self.queue.try_send(obs);
        if !ok {
            log::warn!("observation queue full, dropping observation");
        }
        ok
    }

    /// `setGpsFix`. A `false` fix clears the GNSS-mode anchor.
    pub fn set_gps_fix(&self, fix: GnssFix) {
        self.gnss.set(fix);
        if !fix.valid {
            critical_section::with(|cs| {
                self.inner.borrow(cs).borrow_mut().seg.clear_gnss_anchor();
            });
        }
    }

    /// Drains the observation queue and advances segmentation/expiry.
    /// Approximates the processing loop's 250ms-timeout receive body
    /// without requiring an async runtime in this crate: `now_s` stands in
    /// for the wall-clock read the real loop would take each iteration.
    pub fn process_pending(&self, now_s: u32) {
        while let Some(obs) = self.queue.try_recv() {
            self.process_observation(obs);
        }
        let gnss = self.gnss.get();
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            let anchors_snapshot = inner.tables.anchors;
            inner.seg.advance(gnss, &anchors_snapshot, now_s);
            inner.tables.expire_tables(now_s);
        });
    }

    pub fn process_observation(&self, obs: Observation) {
        let window_unique_hits = critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            let window = obs.ts_s / WINDOW_SEC;
            if window != inner.current_window {
                inner.current_window = window;
                inner.window_unique_hits = 0;
            }
            inner.window_unique_hits += 1;
            inner.window_unique_hits
        });

        let gnss = self.gnss.get();

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            let current_segment = inner.seg.segment_id;

            match obs.kind {
                ObservationKind::WifiProbeReq | ObservationKind::BleAdv => {
                    let kind = if obs.kind == ObservationKind::BleAdv {
                        TrackKind::BleAdv
                    } else {
                        TrackKind::WifiClient
                    };
                    let Some(i) = inner
                        .tables
                        .find_or_alloc_track(kind, obs.addr, obs.ts_s, current_segment)
                    else {
                        let mut sat = self.allocation_saturations.borrow(cs).borrow_mut();
                        *sat = sat.saturating_add(1);
                        log::warn!("track table saturated with watched entries, dropping observation");
                        return;
                    };
                    inner
                        .tables
                        .update_track_from_obs(i, obs.rssi_dbm, obs.ts_s, current_segment, window_unique_hits);

                    if gnss.valid {
                        if let Some(t) = inner.tables.tracks[i].as_mut() {
                            t.flags |= FLAG_HAS_GEO;
                            t.last_geo_s = obs.ts_s;
                            t.last_lat = gnss.lat;
                            t.last_lon = gnss.lon;
                        }
                    }

                    if obs.kind == ObservationKind::BleAdv {
                        if let Some(t) = inner.tables.tracks[i].as_mut() {
                            merge_classifier(t, &obs);
                        }
                    }
                }
                ObservationKind::WifiApBeacon | ObservationKind::WifiApProbeResp => {
                    let Some(i) = inner.tables.find_or_alloc_anchor(obs.addr, obs.ts_s) else {
                        let mut sat = self.allocation_saturations.borrow(cs).borrow_mut();
                        *sat = sat.saturating_add(1);
                        log::warn!("anchor table saturated with watched entries, dropping observation");
                        return;
                    };
                    let Some(a) = inner.tables.anchors[i].as_mut() else {
                        return;
                    };
                    a.last_seen_s = obs.ts_s;
                    a.last_rssi = obs.rssi_dbm;
                    if obs.ssid_len > 0 {
                        a.ssid = obs.ssid;
                        a.ssid_len = obs.ssid_len;
                    }
                    if gnss.valid {
                        a.flags |= FLAG_HAS_GEO;
                        a.last_geo_s = obs.ts_s;
                        a.last_lat = gnss.lat;
                        a.last_lon = gnss.lon;

                        if a.w_sum == 0.0 || obs.rssi_dbm > a.best_rssi {
                            a.best_rssi = obs.rssi_dbm;
                            a.best_lat = gnss.lat;
                            a.best_lon = gnss.lon;
                        }
                        let w = 1.0 + 9.0 * clamp01((obs.rssi_dbm as f32 + 95.0) / 60.0) as f64;
                        a.w_sum += w;
                        a.w_lat += w * gnss.lat;
                        a.w_lon += w * gnss.lon;
                    }
                }
            }
        });
    }

    /// `buildSnapshot`.
    pub fn build_snapshot(&self, max_out: usize, stationary_ratio: f32) -> heapless::Vec<EntityView, SNAPSHOT_CAP> {
        critical_section::with(|cs| {
            let inner = self.inner.borrow(cs).borrow();
            build_snapshot(&inner.tables, inner.seg.move_segments, stationary_ratio, max_out)
        })
    }

    /// `updateEntity`: toggles Watching for the slot identified by
    /// (kind, index).
    pub fn update_entity(&self, kind: EntityKind, index: u16, watching: bool) -> bool {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            match kind {
                EntityKind::WifiAp => {
                    for a in inner.tables.anchors.iter_mut().flatten() {
                        if a.index == index {
                            set_flag(&mut a.flags, FLAG_WATCHING, watching);
                            return true;
                        }
                    }
                    false
                }
                EntityKind::WifiClient | EntityKind::BleAdv => {
                    let want = if kind == EntityKind::WifiClient {
                        TrackKind::WifiClient
                    } else {
                        TrackKind::BleAdv
                    };
                    for t in inner.tables.tracks.iter_mut().flatten() {
                        if t.index == index && t.kind == want {
                            set_flag(&mut t.flags, FLAG_WATCHING, watching);
                            return true;
                        }
                    }
                    false
                }
            }
        })
    }

    pub fn reset(&self) {
        self.queue.drain();
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow(cs).borrow_mut();
            inner.tables.reset();
            inner.seg.reset();
            inner.current_window = 0;
            inner.window_unique_hits = 0;
        });
        self.gnss.set(GnssFix::INVALID);
        log::info!("device tracker reset");
    }

    pub fn segment_id(&self) -> u32 {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().seg.segment_id)
    }

    pub fn move_segments(&self) -> u32 {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().seg.move_segments)
    }

    pub fn last_env_tick_s(&self) -> u32 {
        critical_section::with(|cs| self.inner.borrow(cs).borrow().seg.last_env_tick_s)
    }

    pub fn allocation_saturations(&self) -> u32 {
        critical_section::with(|cs| *self.allocation_saturations.borrow(cs).borrow())
    }

    pub fn queue_dropped_count(&self) -> u32 {
        self.queue.dropped_count()
    }

    /// Gives `export.rs` read access to the tables for `writeWatchlist`/
    /// `writeWatchlistKml` without exposing the lock to callers.
    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&EntityTables) -> R) -> R {
        critical_section::with(|cs| f(&self.inner.borrow(cs).borrow().tables))
    }

    /// Gives `export.rs` write access to the tables for `readWatchlist`.
    pub(crate) fn with_tables_mut<R>(&self, f: impl FnOnce(&mut EntityTables) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow(cs).borrow_mut().tables))
    }
}

impl Default for DeviceTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn set_flag(flags: &mut u8, bit: u8, set: bool) {
    if set {
        *flags |= bit;
    } else {
        *flags &= !bit;
    }
}

fn merge_classifier(t: &mut Track, obs: &Observation) {
    if obs.tracker_type != TrackerType::Unknown {
        t.tracker_type = obs.tracker_type;
        if t.vendor == Vendor::Unknown {
            t.vendor = wids::vendor_from_tracker_type(obs.tracker_type);
        }
    }
    if obs.google_mfr != GoogleMfr::Unknown {
        t.tracker_google_mfr = obs.google_mfr;
    }
    if obs.samsung_subtype != SamsungSubtype::Unknown {
        t.tracker_samsung_subtype = obs.samsung_subtype;
    }
    t.tracker_confidence = t.tracker_confidence.max(obs.confidence);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lat_offset_deg(meters: f64) -> f64 {
        meters / 111_320.0
    }

    #[test]
    fn fresh_track_single_observation() {
        let tracker = DeviceTracker::new();
        tracker.process_observation(Observation::ble(
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            -60,
            100,
            TrackerType::Unknown,
            GoogleMfr::Unknown,
            SamsungSubtype::Unknown,
            0,
        ));
        let rows = tracker.build_snapshot(16, 0.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].index, 1);
        assert_eq!(rows[0].rssi, -92);
        assert_eq!(rows[0].kind, EntityKind::BleAdv);
    }

    #[test]
    fn seen_and_near_windows_increment_on_first_observation() {
        let tracker = DeviceTracker::new();
        tracker.process_observation(Observation::ble(
            [1, 2, 3, 4, 5, 6],
            -60,
            100,
            TrackerType::Unknown,
            GoogleMfr::Unknown,
            SamsungSubtype::Unknown,
            0,
        ));
        tracker.with_tables(|tables| {
            let t = tables.tracks[0].unwrap();
            assert_eq!(t.seen_windows, 1);
            assert_eq!(t.near_windows, 1);
        });
    }

    #[test]
    fn indices_are_unique_and_never_zero() {
        let tracker = DeviceTracker::new();
        for i in 0..5u8 {
            tracker.process_observation(Observation::ble(
                [i, 0, 0, 0, 0, 0],
                -60,
                100,
                TrackerType::Unknown,
                GoogleMfr::Unknown,
                SamsungSubtype::Unknown,
                0,
            ));
        }
        let rows = tracker.build_snapshot(16, 0.0);
        let mut seen = heapless::Vec::<u16, 16>::new();
        for r in rows.iter() {
            assert_ne!(r.index, 0);
            assert!(!seen.contains(&r.index));
            let _ = seen.push(r.index);
        }
    }

    #[test]
    fn watched_track_survives_reset_and_eviction() {
        let tracker = DeviceTracker::new();
        tracker.process_observation(Observation::ble(
            [9, 9, 9, 9, 9, 9],
            -60,
            100,
            TrackerType::Unknown,
            GoogleMfr::Unknown,
            SamsungSubtype::Unknown,
            0,
        ));
        let idx = tracker.build_snapshot(16, 0.0)[0].index;
        assert!(tracker.update_entity(EntityKind::BleAdv, idx, true));

        tracker.reset();
        let rows = tracker.build_snapshot(16, 0.0);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].watching());
        assert_eq!(rows[0].index, idx);
    }

    #[test]
    fn gnss_segmentation_advances_only_past_threshold() {
        let tracker = DeviceTracker::new();
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: 37.7749,
            lon: -122.4194,
            ..GnssFix::INVALID
        });
        tracker.process_pending(0);
        assert_eq!(tracker.segment_id(), 0);

        // ~44m east — must not advance.
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: 37.7749,
            lon: -122.4199,
            ..GnssFix::INVALID
        });
        tracker.process_pending(20);
        assert_eq!(tracker.segment_id(), 0);

        // ~88m east from the original anchor — must advance by exactly 1.
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: 37.7749,
            lon: -122.4200,
            ..GnssFix::INVALID
        });
        tracker.process_pending(30);
        assert_eq!(tracker.segment_id(), 1);
        assert_eq!(tracker.move_segments(), 1);
    }

    #[test]
    fn gnss_49m_does_not_advance_51m_after_10s_does() {
        let tracker = DeviceTracker::new();
        let base_lat = 37.0;
        let lon = -122.0;
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: base_lat,
            lon,
            ..GnssFix::INVALID
        });
        tracker.process_pending(0);

        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: base_lat + lat_offset_deg(49.0),
            lon,
            ..GnssFix::INVALID
        });
        tracker.process_pending(20);
        assert_eq!(tracker.segment_id(), 0);

        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: base_lat + lat_offset_deg(51.0),
            lon,
            ..GnssFix::INVALID
        });
        tracker.process_pending(31);
        assert_eq!(tracker.segment_id(), 1);
    }

    #[test]
    fn setting_gnss_invalid_clears_anchor_so_next_fix_rebaselines() {
        let tracker = DeviceTracker::new();
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: 10.0,
            lon: 10.0,
            ..GnssFix::INVALID
        });
        tracker.process_pending(0);
        tracker.set_gps_fix(GnssFix::INVALID);
        tracker.process_pending(100);
        // Fresh baseline far away must not itself trigger an advance.
        tracker.set_gps_fix(GnssFix {
            valid: true,
            lat: 20.0,
            lon: 20.0,
            ..GnssFix::INVALID
        });
        tracker.process_pending(101);
        assert_eq!(tracker.segment_id(), 0);
    }

    #[test]
    fn scoring_persistence_monotonic() {
        let mut t = Track {
            kind: TrackKind::BleAdv,
            addr: [0; 6],
            vendor: Vendor::Unknown,
            flags: 0,
            index: 1,
            first_seen_s: 0,
            last_seen_s: 60,
            last_window: 0,
            seen_windows: 1,
            near_windows: 1,
            ema_rssi: -60.0,
            ema_abs_dev: 0.0,
            last_segment_id: 0,
            env_hits: 1,
            crowd_ema: 0.0,
            last_geo_s: 0,
            last_lat: 0.0,
            last_lon: 0.0,
            tracker_type: TrackerType::Unknown,
            tracker_google_mfr: GoogleMfr::Unknown,
            tracker_samsung_subtype: SamsungSubtype::Unknown,
            tracker_confidence: 0,
        };
        let short = score(&t, 1, 0.0);
        t.last_seen_s = 600;
        let long = score(&t, 1, 0.0);
        assert!(long >= short);
    }

    #[test]
    fn scoring_crowd_penalty_direction() {
        let mut t = Track {
            kind: TrackKind::BleAdv,
            addr: [0; 6],
            vendor: Vendor::Unknown,
            flags: 0,
            index: 1,
            first_seen_s: 0,
            last_seen_s: 600,
            last_window: 0,
            seen_windows: 10,
            near_windows: 10,
            ema_rssi: -60.0,
            ema_abs_dev: 0.0,
            last_segment_id: 0,
            env_hits: 1,
            crowd_ema: 5.0,
            last_geo_s: 0,
            last_lat: 0.0,
            last_lon: 0.0,
            tracker_type: TrackerType::Unknown,
            tracker_google_mfr: GoogleMfr::Unknown,
            tracker_samsung_subtype: SamsungSubtype::Unknown,
            tracker_confidence: 0,
        };
        let low_crowd = score(&t, 1, 0.0);
        t.crowd_ema = 40.0;
        let high_crowd = score(&t, 1, 0.0);
        assert!(high_crowd <= low_crowd);
    }

    #[test]
    fn anchor_rows_always_score_zero() {
        let tracker = DeviceTracker::new();
        tracker.process_observation(Observation::wifi(
            ObservationKind::WifiApBeacon,
            [1, 2, 3, 4, 5, 6],
            -50,
            "TestNet",
            10,
        ));
        let rows = tracker.build_snapshot(16, 0.0);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, 0.0);
    }

    #[test]
    fn queue_full_drop_does_not_corrupt_subsequent_observations() {
        let tracker = DeviceTracker::new();
        for i in 0..(QUEUE_CAPACITY + 5) {
            tracker.enqueue(Observation::ble(
                [i as u8, 0, 0, 0, 0, 1],
                -60,
                10,
                TrackerType::Unknown,
                GoogleMfr::Unknown,
                SamsungSubtype::Unknown,
                0,
            ));
        }
        assert!(tracker.queue_dropped_count() > 0);
        tracker.process_pending(10);
        let rows = tracker.build_snapshot(512, 0.0);
        assert_eq!(rows.len(), QUEUE_CAPACITY);
    }
}
