//! Proximity tracker library — passive Wi-Fi/BLE observation pipeline.
//!
//! This crate contains the full tracking engine with no platform
//! dependencies, testable on any host with `cargo test`. Platform binaries
//! (ESP32 firmware, ESP-IDF std firmware) are thin consumers that provide
//! radio access, a GNSS source, and persistent storage for the watchlist.
//!
//! Module layers:
//! - `scanner`, `board` — frame/advertisement parsing and board constants,
//!   `no_std`, no allocator.
//! - `observation`, `channel`, `gps`, `wids` — the observation record, the
//!   bounded queue, the GNSS snapshot, and vendor/tracker classification;
//!   `no_std`, no allocator.
//! - `tracker` — entity tables, segmentation, scoring, and the
//!   `DeviceTracker` facade; `no_std`, no allocator.
//! - `export` — watchlist JSON and KML I/O; `no_std` + `alloc`.
//! - `wire` — host/device NDJSON command and status framing; `no_std`, no
//!   allocator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod board;
pub mod channel;
pub mod export;
pub mod gps;
pub mod observation;
pub mod scanner;
pub mod tracker;
pub mod wids;
pub mod wire;
