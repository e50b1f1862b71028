//! Proximity tracker firmware — passive Wi-Fi/BLE scanner feeding a
//! `DeviceTracker`, served to a companion app over BLE GATT and serial.
//!
//! The companion app drives watchlist management and GPS fix injection and
//! consumes the periodic entity snapshot. All tracking/scoring logic lives
//! in the library; this binary wires radios, timers, and the NDJSON wire
//! protocol to the `DeviceTracker` facade.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

// Hardware-specific modules (binary crate only)
#[cfg(feature = "m5stickc")]
mod buzzer;
#[cfg(feature = "m5stickc")]
mod display;

// Re-export library modules so binary submodules (display, buzzer) can use crate::*
pub(crate) use proximity_tracker::{board, export, gps, observation, scanner, tracker, wids, wire};

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::timer::timg::TimerGroup;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use gps::GnssFix;
use observation::{Observation, ObservationKind};
use scanner::{BleAdvParser, FrameType};
use tracker::DeviceTracker;
use wids::classify;
use wire::{HostCommand, LineReader, StatusInfo};

// ── BLE GATT server definition ──────────────────────────────────────
//
// Proc macros require string literals, so these duplicate `wire::ble_uuids`
// — that module is the canonical source of truth.

#[gatt_service(uuid = "7a1e0001-2c9b-4a3e-9d4f-6b8e3c7d0a11")]
struct ProxTrackGattService {
    /// TX — NDJSON entity/status rows, notify-only.
    /// Messages are chunked into `wire::BLE_MAX_NOTIFY`-sized pieces; the
    /// companion accumulates until it sees '\n'.
    #[characteristic(uuid = "7a1e0002-2c9b-4a3e-9d4f-6b8e3c7d0a11", notify)]
    tx: [u8; 20],

    /// RX — host commands, write-only. NDJSON lines accumulated via
    /// `LineReader`.
    #[characteristic(uuid = "7a1e0003-2c9b-4a3e-9d4f-6b8e3c7d0a11", write)]
    rx: [u8; 20],
}

#[gatt_server]
struct ProxTrackServer {
    prox_service: ProxTrackGattService,
}

// ── Channel type aliases ──────────────────────────────────────────────

type MsgBuffer = heapless::Vec<u8, { wire::MAX_OUT_LINE_LEN }>;
type OutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 8>;
type BleOutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 4>;
type CommandChannel = Channel<CriticalSectionRawMutex, HostCommand, 4>;

// ── Static state ───────────────────────────────────────────────────────

/// The whole tracking engine: observation queue, entity tables,
/// segmentation, and the GNSS snapshot. One instance for the process
/// lifetime — no per-task state duplication.
static TRACKER: DeviceTracker = DeviceTracker::new();

/// Serialized NDJSON output awaiting delivery.
static OUTPUT_CHANNEL: OutputChannel = Channel::new();

/// Host commands parsed off the RX characteristic/serial.
static CMD_CHANNEL: CommandChannel = Channel::new();

/// BLE output — the serial task clones messages here for the GATT server
/// to send as notifications.
static BLE_OUTPUT_CHANNEL: BleOutputChannel = Channel::new();

/// Whether scanning is active (toggled by host Start/Stop commands).
pub(crate) static SCANNING: AtomicBool = AtomicBool::new(true);

/// Number of connected BLE clients.
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);

/// Counters for display: entities in the last snapshot, and how many are
/// on the watchlist.
pub(crate) static TRACKED_COUNT: AtomicU32 = AtomicU32::new(0);
pub(crate) static WATCHING_COUNT: AtomicU32 = AtomicU32::new(0);

/// Last reported GNSS ground speed (m/s), used for the scoring engine's
/// `stationary_ratio` input. Updated by `set_gps_fix` host commands.
static LAST_GPS_SPEED: Mutex<Cell<f32>> = Mutex::new(Cell::new(0.0));

/// Whether the buzzer is enabled (M5StickC only).
#[cfg(feature = "m5stickc")]
pub(crate) static BUZZER_ENABLED: AtomicBool = AtomicBool::new(true);

/// Signal channel for buzzer beeps (M5StickC only) — fired when a watched
/// entity is observed nearby.
#[cfg(feature = "m5stickc")]
pub(crate) static BUZZER_SIGNAL: Channel<CriticalSectionRawMutex, (), 1> = Channel::new();

fn now_s() -> u32 {
    (Instant::now().as_millis() / 1000) as u32
}

/// Crude stationary estimate from the last reported GNSS speed.
/// Accelerometer-based motion detection is out of scope for the boards
/// this firmware targets.
fn stationary_ratio() -> f32 {
    let speed = critical_section::with(|cs| LAST_GPS_SPEED.borrow(cs).get());
    if speed < 0.3 {
        1.0
    } else {
        0.0
    }
}

// ── WiFi sniffer (ISR context) ──────────────────────────────────────

/// WiFi sniffer callback — called from ISR context by the esp-radio sniffer.
///
/// Parses raw 802.11 frames with `parse_wifi_frame()` and enqueues the
/// resulting `Observation` directly (non-blocking, no allocation).
fn wifi_sniffer_callback(pkt: esp_radio::wifi::sniffer::PromiscuousPkt<'_>) {
    let rssi = pkt.rx_cntl.rssi as i8;
    let channel = pkt.rx_cntl.channel as u8;
    let Some(event) = scanner::parse_wifi_frame(pkt.data, rssi, channel) else {
        return;
    };
    let kind = match event.frame_type {
        FrameType::Beacon => ObservationKind::WifiApBeacon,
        FrameType::ProbeResponse => ObservationKind::WifiApProbeResp,
        FrameType::ProbeRequest => ObservationKind::WifiProbeReq,
        // Data/other frames carry no SSID and aren't part of the tracking
        // model — only management frames produce observations.
        FrameType::Data | FrameType::Other => return,
    };
    let obs = Observation::wifi(kind, event.mac, event.rssi, event.ssid.as_str(), now_s());
    let _ = TRACKER.enqueue(obs);
}

// FFI binding for WiFi channel control.
// The symbol is linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
}

/// WiFi channel hop task — cycles through 2.4 GHz channels to capture
/// traffic across all channels.
#[embassy_executor::task]
async fn wifi_channel_hop_task() {
    loop {
        for &ch in scanner::WIFI_CHANNELS {
            unsafe {
                esp_wifi_set_channel(ch, 0);
            }
            Timer::after(Duration::from_millis(scanner::DEFAULT_DWELL_MS)).await;
        }
    }
}

// ── BLE scan event handler ──────────────────────────────────────────

/// EventHandler for BLE advertisement reports from trouble-host.
///
/// Classifies each report against the trackable-beacon table and enqueues
/// the resulting `Observation`. Called synchronously from the runner —
/// must not block.
struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        while let Some(Ok(report)) = it.next() {
            let addr_bytes: &[u8; 6] = report.addr.raw().try_into().unwrap();
            let event = BleAdvParser::parse(addr_bytes, report.rssi, report.data);
            let mfg = if event.manufacturer_id != 0 {
                Some((event.manufacturer_id, event.manufacturer_payload.as_slice()))
            } else {
                None
            };
            let name = if event.name.is_empty() {
                None
            } else {
                Some(event.name.as_str())
            };
            let info = classify(&event.service_uuids_16, mfg, name);
            let obs = Observation::ble(
                *addr_bytes,
                event.rssi,
                now_s(),
                info.tracker_type,
                info.google_mfr,
                info.samsung_subtype,
                info.confidence,
            );
            let _ = TRACKER.enqueue(obs);
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // Set up heap allocator (needed for BLE + WiFi coex stacks).
    // ESP32-S3 needs more heap for coex; ESP32 is tighter on DRAM.
    #[cfg(feature = "esp32")]
    {
        esp_alloc::heap_allocator!(size: 64 * 1024);
    }
    #[cfg(not(feature = "esp32"))]
    {
        esp_alloc::heap_allocator!(size: 128 * 1024);
    }

    // Start the RTOS — requires timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!(
        "proximity-tracker v{} starting on {}",
        wire::VERSION,
        board::BOARD_NAME
    );

    // Spawn non-BLE tasks
    spawner.spawn(tracker_tick_task()).unwrap();
    spawner.spawn(output_serial_task()).unwrap();
    spawner.spawn(command_task()).unwrap();

    // Hold power on (M5StickC Plus2 needs GPIO4 HIGH to stay powered)
    #[cfg(feature = "m5stickc")]
    let _power_hold = esp_hal::gpio::Output::new(
        peripherals.GPIO4,
        esp_hal::gpio::Level::High,
        esp_hal::gpio::OutputConfig::default(),
    );

    // Display + buzzer tasks (M5StickC only)
    #[cfg(feature = "m5stickc")]
    {
        spawner
            .spawn(display::display_task(
                peripherals.SPI2,
                peripherals.GPIO15,
                peripherals.GPIO13,
                peripherals.GPIO5,
                peripherals.GPIO14,
                peripherals.GPIO12,
                peripherals.GPIO27,
            ))
            .unwrap();
        log::info!("Display task spawned");

        spawner
            .spawn(buzzer::buzzer_task(peripherals.LEDC, peripherals.GPIO2))
            .unwrap();
        log::info!("Buzzer task spawned");
    }

    log::info!(
        "Build target: {}",
        if cfg!(feature = "xiao") {
            "xiao (ESP32-S3)"
        } else if cfg!(feature = "m5stickc") {
            "m5stickc (ESP32)"
        } else {
            "unknown"
        }
    );

    // ── BLE radio initialization ───────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");

    log::info!("BLE connector initialized");

    // ── WiFi sniffer initialization ─────────────────────────────────────

    let (_wifi_controller, wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");

    let mut sniffer = wifi_interfaces.sniffer;
    sniffer.set_receive_cb(wifi_sniffer_callback);
    sniffer
        .set_promiscuous_mode(true)
        .expect("Promiscuous mode failed");

    spawner.spawn(wifi_channel_hop_task()).unwrap();

    log::info!("WiFi sniffer initialized in promiscuous mode");

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xab]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        central,
        mut runner,
        ..
    } = stack.build();

    log::info!("BLE radio initialized");

    // Create GATT server
    let server = ProxTrackServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: wire::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .expect("GATT server init failed");

    // Event handler for BLE advertisement reports
    let scan_handler = ScanEventHandler;

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    // Three concurrent futures via join3:
    //   1. BLE stack runner (drives HCI, delivers scan reports to handler)
    //   2. BLE scanner (starts scan, keeps session alive)
    //   3. GATT server (advertise, accept connections, send notifications)

    let _ = embassy_futures::join::join3(
        // ── Runner: drives the BLE stack ────────────────────────────────
        async {
            loop {
                if let Err(e) = runner.run_with_handler(&scan_handler).await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        // ── Scanner: start BLE scan and keep session alive ──────────────
        async {
            let mut scanner = trouble_host::scan::Scanner::new(central);
            let config = ScanConfig::default();

            let result = scanner.scan(&config).await;
            let _session = match result {
                Ok(session) => session,
                Err(e) => {
                    log::error!("BLE scan failed to start: {:?}", e);
                    return;
                }
            };

            log::info!("BLE scan started (active, continuous)");
            // Session stays alive as long as _session exists.
            // Reports flow through ScanEventHandler on the runner.
            loop {
                Timer::after(Duration::from_secs(60)).await;
            }
        },
        // ── GATT server: advertise, connect, notify ─────────────────────
        async {
            loop {
                // Build advertisement data
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(wire::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                // Start advertising
                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                log::info!("BLE advertising as '{}'", wire::BLE_ADV_NAME);

                // Wait for a central to connect
                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                log::info!("BLE client connected");
                BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);

                // Handle the connection until disconnect
                handle_gatt_connection(&gatt_conn, &server).await;

                BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

/// Handle a GATT connection: forward output messages as notifications
/// and process incoming writes as host commands.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s ProxTrackServer<'_>,
) {
    let ble_rx = BLE_OUTPUT_CHANNEL.receiver();
    let mut line_reader = LineReader::new();

    loop {
        match embassy_futures::select::select(ble_rx.receive(), conn.next()).await {
            embassy_futures::select::Either::First(msg) => {
                // Chunk the NDJSON message into BLE_MAX_NOTIFY-sized pieces.
                // Pad with newlines so the companion NDJSON parser sees
                // harmless empty lines instead of null bytes.
                for chunk in msg.chunks(wire::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    if server
                        .prox_service
                        .tx
                        .notify(conn, &padded)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            embassy_futures::select::Either::Second(event) => {
                match event {
                    GattConnectionEvent::Disconnected { .. } => return,
                    GattConnectionEvent::Gatt { event } => {
                        // Check if this is a write to our RX characteristic
                        if let GattEvent::Write(ref write_event) = event {
                            if write_event.handle() == server.prox_service.rx.handle {
                                for &byte in write_event.data() {
                                    if let Some(line) = line_reader.feed(byte) {
                                        if let Some(cmd) = wire::parse_command(line) {
                                            let _ = CMD_CHANNEL.try_send(cmd);
                                        }
                                    }
                                }
                            }
                        }
                        // Must accept/reply to all GATT events
                        match event.accept() {
                            Ok(reply) => reply.send().await,
                            Err(_) => {}
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Queue a (possibly oversized) NDJSON payload for delivery, splitting it
/// across as many output-channel messages as needed. The host's line
/// reader reassembles by byte content, not by message boundary, so a split
/// here is invisible downstream.
fn send_output(text: &str) {
    for chunk in text.as_bytes().chunks(wire::MAX_OUT_LINE_LEN) {
        let mut buf = MsgBuffer::new();
        if buf.extend_from_slice(chunk).is_err() {
            continue;
        }
        let _ = OUTPUT_CHANNEL.try_send(buf);
    }
}

fn send_status(scanning: bool) {
    let info = StatusInfo {
        scanning,
        uptime_s: now_s(),
        heap_free: esp_alloc::HEAP.free() as u32,
        ble_clients: BLE_CLIENTS.load(Ordering::Relaxed),
        board: board::BOARD_NAME,
        segment_id: TRACKER.segment_id(),
        move_segments: TRACKER.move_segments(),
        queue_dropped: TRACKER.queue_dropped_count(),
        allocation_saturations: TRACKER.allocation_saturations(),
    };
    let mut buf = MsgBuffer::new();
    buf.resize_default(wire::MAX_OUT_LINE_LEN).ok();
    if let Some(len) = wire::serialize_status(&info, &mut buf) {
        buf.truncate(len);
        let _ = OUTPUT_CHANNEL.try_send(buf);
    }
}

/// Periodic tracking tick: drains the observation queue, advances
/// segmentation, and emits the current entity snapshot as NDJSON rows.
#[embassy_executor::task]
async fn tracker_tick_task() {
    log::info!("tracker tick task started");

    loop {
        Timer::after(Duration::from_secs(1)).await;

        if !SCANNING.load(Ordering::Relaxed) {
            continue;
        }

        TRACKER.process_pending(now_s());

        let snapshot = TRACKER.build_snapshot(32, stationary_ratio());

        let mut tracked = 0u32;
        let mut watching = 0u32;
        for view in snapshot.iter() {
            tracked += 1;
            if view.watching() {
                watching += 1;
                #[cfg(feature = "m5stickc")]
                if view.rssi >= tracker::RSSI_NEAR_DBM {
                    let _ = BUZZER_SIGNAL.try_send(());
                }
            }

            let mut buf = MsgBuffer::new();
            buf.resize_default(wire::MAX_OUT_LINE_LEN).ok();
            if let Some(len) = wire::serialize_entity_row(view, &mut buf) {
                buf.truncate(len);
                let _ = OUTPUT_CHANNEL.try_send(buf);
            }
        }
        TRACKED_COUNT.store(tracked, Ordering::Relaxed);
        WATCHING_COUNT.store(watching, Ordering::Relaxed);
    }
}

/// Serial output task — reads from the output channel, logs to serial,
/// and forwards a clone to the BLE output channel.
#[embassy_executor::task]
async fn output_serial_task() {
    log::info!("Serial output task started");

    let output_rx = OUTPUT_CHANNEL.receiver();

    loop {
        let msg = output_rx.receive().await;

        // Forward to BLE output channel (non-blocking, drops if full or no client)
        let _ = BLE_OUTPUT_CHANNEL.try_send(msg.clone());

        // Log to serial via esp-println
        if let Ok(s) = core::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}

/// Host command processing task — drains CMD_CHANNEL, applies tracker
/// state changes, and responds to status/watchlist requests.
#[embassy_executor::task]
async fn command_task() {
    let cmd_rx = CMD_CHANNEL.receiver();

    loop {
        let cmd = cmd_rx.receive().await;

        match cmd {
            HostCommand::Start => {
                SCANNING.store(true, Ordering::Relaxed);
                log::info!("scanning started by host command");
            }
            HostCommand::Stop => {
                SCANNING.store(false, Ordering::Relaxed);
                log::info!("scanning stopped by host command");
            }
            HostCommand::GetStatus => {
                send_status(SCANNING.load(Ordering::Relaxed));
            }
            HostCommand::SetGpsFix {
                lat,
                lon,
                sats,
                speed,
                course,
                altitude,
            } => {
                critical_section::with(|cs| LAST_GPS_SPEED.borrow(cs).set(speed));
                TRACKER.set_gps_fix(GnssFix {
                    valid: true,
                    lat,
                    lon,
                    sats,
                    speed,
                    course,
                    altitude,
                    last_update_ms: Instant::now().as_millis() as u32,
                });
            }
            HostCommand::SetWatch {
                kind,
                index,
                watching,
            } => {
                let ok = TRACKER.update_entity(kind, index, watching);
                if !ok {
                    log::warn!(
                        "set_watch: no entity for kind={:?} index={}",
                        kind,
                        index
                    );
                }
            }
            HostCommand::WatchlistGet => {
                let mut json = export::write_watchlist(&TRACKER);
                json.push('\n');
                send_output(&json);
            }
            HostCommand::WatchlistGetKml => {
                let mut kml = export::write_watchlist_kml(&TRACKER);
                kml.push('\n');
                send_output(&kml);
            }
            HostCommand::WatchlistSet { json } => {
                if !export::read_watchlist(json.as_str(), &TRACKER, now_s()) {
                    log::warn!("malformed watchlist document rejected");
                }
            }
        }
    }
}
