//! Proximity tracker — ESP-IDF std firmware.
//!
//! Thread-based implementation using FreeRTOS threads and std::sync::mpsc
//! channels. Feature-equivalent to the no_std Embassy firmware but uses
//! ESP-IDF services (NimBLE via esp32-nimble, WiFi via esp-idf-svc).

#[cfg(feature = "m5stickc")]
mod buzzer;
#[cfg(feature = "m5stickc")]
mod display;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use proximity_tracker::{board, export, gps, observation, scanner, tracker, wids, wire};

use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::task::block_on;
use esp_idf_svc::sys::{
    esp, esp_get_free_heap_size, esp_wifi_set_channel, esp_wifi_set_promiscuous,
    esp_wifi_set_promiscuous_rx_cb, wifi_promiscuous_pkt_t, wifi_promiscuous_pkt_type_t,
    wifi_second_chan_t_WIFI_SECOND_CHAN_NONE,
};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};

use gps::GnssFix;
use observation::{Observation, ObservationKind};
use scanner::FrameType;
use tracker::DeviceTracker;
use wids::classify;
use wire::{HostCommand, LineReader, StatusInfo};

use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLEDevice, BLEScan, NimbleProperties};

// ── Shared state (mirrors the no_std firmware's statics) ────────────

pub(crate) static SCANNING: AtomicBool = AtomicBool::new(true);
pub(crate) static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);
pub(crate) static TRACKED_COUNT: AtomicU32 = AtomicU32::new(0);
pub(crate) static WATCHING_COUNT: AtomicU32 = AtomicU32::new(0);
pub(crate) static BUZZER_ENABLED: AtomicBool = AtomicBool::new(true);
static LAST_GPS_SPEED: Mutex<f32> = Mutex::new(0.0);

/// The whole tracking engine — one instance for the process lifetime.
static TRACKER: DeviceTracker = DeviceTracker::new();

type MsgBuffer = heapless::Vec<u8, { wire::MAX_OUT_LINE_LEN }>;

/// Boot time — captured once in main, used for uptime/observation timestamps.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

pub(crate) fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

fn now_s() -> u32 {
    uptime_secs()
}

/// Crude stationary estimate from the last reported GNSS speed.
/// Accelerometer-based motion detection is out of scope for the boards
/// this firmware targets.
fn stationary_ratio() -> f32 {
    let speed = *LAST_GPS_SPEED.lock().unwrap();
    if speed < 0.3 {
        1.0
    } else {
        0.0
    }
}

// ── WiFi promiscuous callback ────────────────────────────────────────

/// WiFi promiscuous mode callback.
///
/// Runs in the WiFi driver task context (not ISR on ESP-IDF, but still
/// must be non-blocking). Parses raw 802.11 frames and enqueues the
/// resulting observation directly onto the tracker.
unsafe extern "C" fn promisc_rx_cb(
    buf: *mut std::ffi::c_void,
    _pkt_type: wifi_promiscuous_pkt_type_t,
) {
    let pkt = unsafe { &*(buf as *const wifi_promiscuous_pkt_t) };
    let rssi = pkt.rx_ctrl.rssi() as i8;
    let channel = pkt.rx_ctrl.channel() as u8;
    let sig_len = pkt.rx_ctrl.sig_len() as usize;

    if sig_len == 0 {
        return;
    }

    // Safety: payload is `sig_len` bytes starting at pkt.payload
    let payload = unsafe { std::slice::from_raw_parts(pkt.payload.as_ptr(), sig_len) };

    let Some(event) = scanner::parse_wifi_frame(payload, rssi, channel) else {
        return;
    };
    let kind = match event.frame_type {
        FrameType::Beacon => ObservationKind::WifiApBeacon,
        FrameType::ProbeResponse => ObservationKind::WifiApProbeResp,
        FrameType::ProbeRequest => ObservationKind::WifiProbeReq,
        FrameType::Data | FrameType::Other => return,
    };
    let obs = Observation::wifi(kind, event.mac, event.rssi, event.ssid.as_str(), now_s());
    let _ = TRACKER.enqueue(obs);
}

fn main() -> anyhow::Result<()> {
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    // Record boot time
    *BOOT_INSTANT.lock().unwrap() = Some(Instant::now());

    log::info!(
        "proximity-tracker v{} starting on {} (std)",
        wire::VERSION,
        board::BOARD_NAME
    );

    // ── Peripherals ──────────────────────────────────────────────────

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Hold power on (M5StickC Plus2)
    #[cfg(feature = "m5stickc")]
    let _power_hold = {
        use esp_idf_svc::hal::gpio::PinDriver;
        let mut p = PinDriver::output(peripherals.pins.gpio4)?;
        p.set_high()?;
        p
    };

    // ── Channels ─────────────────────────────────────────────────────

    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);
    let (ble_output_tx, ble_output_rx) = mpsc::sync_channel::<MsgBuffer>(4);
    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);
    #[cfg(feature = "m5stickc")]
    let (buzzer_tx, buzzer_rx) = mpsc::sync_channel::<()>(1);

    // ── Buzzer thread (M5StickC) ─────────────────────────────────────

    #[cfg(feature = "m5stickc")]
    {
        let ledc_timer = peripherals.ledc.timer0;
        let ledc_channel = peripherals.ledc.channel0;
        let buzzer_pin = peripherals.pins.gpio2;
        thread::Builder::new()
            .name("buzzer".into())
            .stack_size(2048)
            .spawn(move || {
                buzzer::buzzer_thread(buzzer_rx, ledc_timer, ledc_channel, buzzer_pin);
            })?;
        log::info!("Buzzer thread spawned");
    }

    // ── Display thread (M5StickC) ────────────────────────────────────

    #[cfg(feature = "m5stickc")]
    {
        let spi2 = peripherals.spi2;
        let mosi = peripherals.pins.gpio15;
        let clk = peripherals.pins.gpio13;
        let cs_pin = peripherals.pins.gpio5;
        let dc_pin = peripherals.pins.gpio14;
        let rst_pin = peripherals.pins.gpio12;
        let bl_pin = peripherals.pins.gpio27;
        thread::Builder::new()
            .name("display".into())
            .stack_size(4096)
            .spawn(move || {
                display::display_thread(spi2, mosi, clk, cs_pin, dc_pin, rst_pin, bl_pin);
            })?;
        log::info!("Display thread spawned");
    }

    // ── Tracker tick thread ──────────────────────────────────────────

    let tick_output_tx = output_tx.clone();
    #[cfg(feature = "m5stickc")]
    let tick_buzzer_tx = buzzer_tx.clone();
    thread::Builder::new()
        .name("tracker-tick".into())
        .stack_size(4096)
        .spawn(move || {
            tracker_tick_thread(
                tick_output_tx,
                #[cfg(feature = "m5stickc")]
                tick_buzzer_tx,
            );
        })?;
    log::info!("Tracker tick thread spawned");

    // ── Output thread ────────────────────────────────────────────────

    thread::Builder::new()
        .name("output".into())
        .stack_size(4096)
        .spawn(move || {
            output_thread(output_rx, ble_output_tx);
        })?;
    log::info!("Output thread spawned");

    // ── Command thread ───────────────────────────────────────────────

    let cmd_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("command".into())
        .stack_size(4096)
        .spawn(move || {
            command_thread(cmd_rx, cmd_output_tx);
        })?;
    log::info!("Command thread spawned");

    // ── WiFi sniffer ─────────────────────────────────────────────────

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    wifi.set_configuration(&esp_idf_svc::wifi::Configuration::Client(Default::default()))?;
    wifi.start()?;

    // Enable promiscuous mode
    unsafe {
        esp!(esp_wifi_set_promiscuous(true))?;
        esp!(esp_wifi_set_promiscuous_rx_cb(Some(promisc_rx_cb)))?;
    }
    log::info!("WiFi sniffer initialized in promiscuous mode");

    // ── Channel hop thread ───────────────────────────────────────────

    thread::Builder::new()
        .name("chanhop".into())
        .stack_size(2048)
        .spawn(move || {
            channel_hop_thread();
        })?;
    log::info!("Channel hop thread spawned");

    // ── BLE (NimBLE) — runs on main thread ───────────────────────────

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

    ble_main(cmd_tx, ble_output_rx);
}

// ── Channel hopping ──────────────────────────────────────────────────

fn channel_hop_thread() {
    loop {
        for &ch in scanner::WIFI_CHANNELS {
            unsafe {
                esp_wifi_set_channel(ch, wifi_second_chan_t_WIFI_SECOND_CHAN_NONE);
            }
            thread::sleep(Duration::from_millis(scanner::DEFAULT_DWELL_MS));
        }
    }
}

// ── Tracker tick thread ──────────────────────────────────────────────

/// Drains the observation queue, advances segmentation, and emits the
/// current entity snapshot as NDJSON rows once a second.
fn tracker_tick_thread(
    output_tx: SyncSender<MsgBuffer>,
    #[cfg(feature = "m5stickc")] buzzer_tx: SyncSender<()>,
) {
    log::info!("Tracker tick thread started");

    loop {
        thread::sleep(Duration::from_secs(1));

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
                    let _ = buzzer_tx.try_send(());
                }
            }

            let mut buf = MsgBuffer::new();
            buf.resize_default(wire::MAX_OUT_LINE_LEN).ok();
            if let Some(len) = wire::serialize_entity_row(view, &mut buf) {
                buf.truncate(len);
                let _ = output_tx.try_send(buf);
            }
        }
        TRACKED_COUNT.store(tracked, Ordering::Relaxed);
        WATCHING_COUNT.store(watching, Ordering::Relaxed);
    }
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: mpsc::Receiver<MsgBuffer>, ble_output_tx: SyncSender<MsgBuffer>) {
    log::info!("Output thread started");

    while let Ok(msg) = output_rx.recv() {
        let _ = ble_output_tx.try_send(msg.clone());

        if let Ok(s) = std::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}

fn send_output(output_tx: &SyncSender<MsgBuffer>, text: &str) {
    for chunk in text.as_bytes().chunks(wire::MAX_OUT_LINE_LEN) {
        let mut buf = MsgBuffer::new();
        if buf.extend_from_slice(chunk).is_err() {
            continue;
        }
        let _ = output_tx.try_send(buf);
    }
}

fn send_status(output_tx: &SyncSender<MsgBuffer>, scanning: bool) {
    let info = StatusInfo {
        scanning,
        uptime_s: uptime_secs(),
        heap_free: unsafe { esp_get_free_heap_size() },
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
        let _ = output_tx.try_send(buf);
    }
}

// ── Command thread ───────────────────────────────────────────────────

fn command_thread(cmd_rx: mpsc::Receiver<HostCommand>, output_tx: SyncSender<MsgBuffer>) {
    while let Ok(cmd) = cmd_rx.recv() {
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
                send_status(&output_tx, SCANNING.load(Ordering::Relaxed));
            }
            HostCommand::SetGpsFix {
                lat,
                lon,
                sats,
                speed,
                course,
                altitude,
            } => {
                *LAST_GPS_SPEED.lock().unwrap() = speed;
                TRACKER.set_gps_fix(GnssFix {
                    valid: true,
                    lat,
                    lon,
                    sats,
                    speed,
                    course,
                    altitude,
                    last_update_ms: uptime_secs().wrapping_mul(1000),
                });
            }
            HostCommand::SetWatch {
                kind,
                index,
                watching,
            } => {
                let ok = TRACKER.update_entity(kind, index, watching);
                if !ok {
                    log::warn!("set_watch: no entity for kind={:?} index={}", kind, index);
                }
            }
            HostCommand::WatchlistGet => {
                let mut json = export::write_watchlist(&TRACKER);
                json.push('\n');
                send_output(&output_tx, &json);
            }
            HostCommand::WatchlistGetKml => {
                let mut kml = export::write_watchlist_kml(&TRACKER);
                kml.push('\n');
                send_output(&output_tx, &kml);
            }
            HostCommand::WatchlistSet { json } => {
                if !export::read_watchlist(json.as_str(), &TRACKER, now_s()) {
                    log::warn!("malformed watchlist document rejected");
                }
            }
        }
    }
}

// ── BLE (NimBLE) main loop ───────────────────────────────────────────

fn ble_main(cmd_tx: SyncSender<HostCommand>, ble_output_rx: mpsc::Receiver<MsgBuffer>) -> ! {
    let ble_device = BLEDevice::take();
    let server = ble_device.get_server();

    // Track connections — NimBLE auto-restarts advertising on disconnect
    server.on_connect(|_server, desc| {
        log::info!("BLE client connected: {}", desc.address());
        BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);
    });
    server.on_disconnect(|desc, _reason| {
        log::info!("BLE client disconnected: {}", desc.address());
        BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
    });

    // Create GATT service with the same UUIDs as the no_std version
    let service_uuid = BleUuid::from_uuid128_string(wire::ble_uuids::SERVICE)
        .expect("invalid service UUID");
    let tx_uuid =
        BleUuid::from_uuid128_string(wire::ble_uuids::TX_CHAR).expect("invalid TX UUID");
    let rx_uuid =
        BleUuid::from_uuid128_string(wire::ble_uuids::RX_CHAR).expect("invalid RX UUID");

    let service = server.create_service(service_uuid);

    let tx_char = service
        .lock()
        .create_characteristic(tx_uuid, NimbleProperties::NOTIFY);

    let rx_char = service
        .lock()
        .create_characteristic(rx_uuid, NimbleProperties::WRITE);

    // RX write handler — parse incoming NDJSON commands
    let cmd_tx_clone = cmd_tx.clone();
    rx_char.lock().on_write(move |args| {
        thread_local! {
            static LINE_READER: std::cell::RefCell<LineReader> =
                std::cell::RefCell::new(LineReader::new());
        }
        LINE_READER.with(|lr| {
            let mut lr = lr.borrow_mut();
            for &byte in args.recv_data() {
                if let Some(line) = lr.feed(byte) {
                    if let Some(cmd) = wire::parse_command(line) {
                        let _ = cmd_tx_clone.try_send(cmd);
                    }
                }
            }
        });
    });

    // Configure and start advertising
    let mut adv_data = BLEAdvertisementData::new();
    adv_data
        .name(wire::BLE_ADV_NAME)
        .add_service_uuid(service_uuid);
    ble_device
        .get_advertising()
        .lock()
        .set_data(&mut adv_data)
        .expect("BLE advertising data failed");
    ble_device
        .get_advertising()
        .lock()
        .start()
        .expect("BLE advertising start failed");
    log::info!("BLE advertising as '{}'", wire::BLE_ADV_NAME);

    // Start BLE scanning in a separate thread
    thread::Builder::new()
        .name("blescan".into())
        .stack_size(4096)
        .spawn(move || {
            ble_scan_thread();
        })
        .expect("BLE scan thread spawn failed");
    log::info!("BLE scan thread spawned");

    // TX notify loop — read from ble_output_rx, notify connected clients
    loop {
        match ble_output_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => {
                if BLE_CLIENTS.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                for chunk in msg.chunks(wire::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    tx_char.lock().set_value(&padded).notify();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    unreachable!("BLE output channel disconnected");
}

// ── BLE scan thread ──────────────────────────────────────────────────

fn ble_scan_thread() {
    log::info!("BLE scan thread started");

    let ble_device = BLEDevice::take();
    let mut scan = BLEScan::new();
    scan.active_scan(true).interval(100).window(99);

    // Run scan in a loop with 5-second rounds
    loop {
        let _ = block_on(scan.start(ble_device, 5000, |device, data| {
            let addr_bytes = device.addr().as_be_bytes();
            let rssi = device.rssi();
            let payload = data.payload();
            let event = scanner::BleAdvParser::parse(&addr_bytes, rssi, payload);
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
                addr_bytes,
                event.rssi,
                now_s(),
                info.tracker_type,
                info.google_mfr,
                info.samsung_subtype,
                info.confidence,
            );
            let _ = TRACKER.enqueue(obs);
            None::<()> // Continue scanning
        }));
    }
}
