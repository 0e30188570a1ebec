//! Boot, Wi-Fi bring-up, and the cooperative main loop.

use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;
use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::gpio::{AnyInputPin, Input, PinDriver, Pull};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::sys;
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use log::{error, info, warn};

use music_buzzer::app::{App, Shared};
use music_buzzer::button::Debouncer;
use music_buzzer::config::{GEN_MSG_QUEUE, MODEL_PATH, PIN_STOP_BTN, WIFI_CHECK_INTERVAL_MS};
use music_buzzer::control::ControlState;
use music_buzzer::gpt::MiniGpt;
use music_buzzer::pwm::{AudioOut, PwmEngine};
use music_buzzer::{songs, web};

const WIFI_SSID: &str = env!("WIFI_SSID");
const WIFI_PASS: &str = env!("WIFI_PASS");

fn main() -> Result<()> {
    // ESP-IDF boilerplate
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("music-buzzer starting up");

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // ── WiFi ───────────────────────────────────────────────────────────────
    info!("Connecting to WiFi...");
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    // Set hostname for mDNS/DHCP identification
    {
        use esp_idf_svc::handle::RawHandle;
        let netif = wifi.wifi().sta_netif();
        unsafe {
            sys::esp_netif_set_hostname(netif.handle(), c"music-buzzer".as_ptr());
        }
    }
    connect_wifi(&mut wifi)?;
    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    info!("WiFi connected — IP: {}", ip_info.ip);

    // ── Storage & model ───────────────────────────────────────────────────
    mount_spiffs()?;
    let model = match MiniGpt::load(MODEL_PATH) {
        Ok(model) => {
            info!("model loaded, generation available");
            Some(model)
        }
        Err(e) => {
            warn!("no usable model ({e}); generation disabled");
            None
        }
    };

    // ── Audio & control ───────────────────────────────────────────────────
    let engine = PwmEngine::new();
    let audio = AudioOut::new(peripherals.timer00, engine)?;
    let control = ControlState::new(songs::SONG_DEFS);
    info!("catalog loaded: {} songs", control.catalog.len() - 1);

    let (gen_tx, gen_rx) = mpsc::sync_channel::<String>(GEN_MSG_QUEUE);
    let (result_tx, result_rx) = mpsc::sync_channel::<String>(1);

    let app = Arc::new(App::new(
        Shared {
            control,
            audio: Box::new(audio),
        },
        model,
        gen_tx,
        result_tx,
    ));

    // ── Server ────────────────────────────────────────────────────────────
    let _server = web::start(app.clone())?;

    // ── Stop button ───────────────────────────────────────────────────────
    // Safety: PIN_STOP_BTN is not claimed anywhere else.
    let stop_pin = unsafe { AnyInputPin::new(i32::from(PIN_STOP_BTN)) };
    let mut button = PinDriver::input(stop_pin)?;
    button.set_pull(Pull::Up)?;
    let mut debouncer = Debouncer::new(true);

    info!("entering main loop");
    run_main_loop(&app, &mut wifi, &mut button, &mut debouncer, gen_rx, result_rx)
}

/// The cooperative main loop: button, scheduler tick, queue drains, Wi-Fi
/// watchdog. Never blocks; every iteration finishes in a few milliseconds.
fn run_main_loop(
    app: &Arc<App>,
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    button: &mut PinDriver<'_, AnyInputPin, Input>,
    debouncer: &mut Debouncer,
    gen_rx: mpsc::Receiver<String>,
    result_rx: mpsc::Receiver<String>,
) -> Result<()> {
    let mut last_wifi_check: u32 = 0;

    loop {
        let now = app.now_ms();

        // Stop button: act on a debounced press (active LOW).
        if debouncer.update(button.is_high(), now) == Some(false) {
            let msgs = {
                let mut shared = app.shared.lock().unwrap();
                let Shared { control, audio } = &mut *shared;
                control.button_pressed(now, audio.as_mut())
            };
            for msg in msgs {
                app.hub.broadcast(&msg);
            }
        }

        // Scheduler: advance players, loop restart, auto-stop.
        let msgs = {
            let mut shared = app.shared.lock().unwrap();
            let Shared { control, audio } = &mut *shared;
            control.tick(now, audio.as_mut())
        };
        for msg in msgs {
            app.hub.broadcast(&msg);
        }

        // Worker broadcast frames.
        while let Ok(msg) = gen_rx.try_recv() {
            app.hub.broadcast(&msg);
        }

        // A finished melody: install it and play.
        if let Ok(mml) = result_rx.try_recv() {
            let msgs = {
                let mut shared = app.shared.lock().unwrap();
                let Shared { control, audio } = &mut *shared;
                control.start_generated(mml, now, audio.as_mut())
            };
            for msg in msgs {
                app.hub.broadcast(&msg);
            }
        }

        // Wi-Fi watchdog: fire-and-forget reconnect, never blocking audio.
        if now.wrapping_sub(last_wifi_check) >= WIFI_CHECK_INTERVAL_MS {
            last_wifi_check = now;
            if !wifi.is_connected().unwrap_or(false) {
                warn!("WiFi down, reconnecting...");
                if let Err(e) = wifi.wifi_mut().connect() {
                    error!("WiFi reconnect failed: {e}");
                }
            }
        }

        FreeRtos::delay_ms(2);
    }
}

// ── WiFi ───────────────────────────────────────────────────────────────────

fn connect_wifi(wifi: &mut BlockingWifi<EspWifi<'static>>) -> Result<()> {
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: WIFI_SSID
            .try_into()
            .map_err(|_| anyhow::anyhow!("SSID too long"))?,
        password: WIFI_PASS
            .try_into()
            .map_err(|_| anyhow::anyhow!("Password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("WiFi started");
    wifi.connect()?;
    info!("WiFi associated");
    wifi.wait_netif_up()?;
    info!("WiFi network interface up");
    Ok(())
}

// ── SPIFFS ─────────────────────────────────────────────────────────────────

/// Mount the read-only `storage` partition that carries the model file.
fn mount_spiffs() -> Result<()> {
    let conf = sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: c"storage".as_ptr(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    unsafe {
        sys::esp!(sys::esp_vfs_spiffs_register(&conf))?;
    }
    info!("SPIFFS mounted at /spiffs");
    Ok(())
}
