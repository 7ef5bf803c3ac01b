mod board;
mod clock;
mod color;
mod config;
mod console;
mod display;
mod error;
mod link;
mod session;
#[cfg(not(target_os = "espidf"))]
mod sim;
mod supervisor;
mod time_sync;
mod timing;
mod ui;

#[cfg(target_os = "espidf")]
mod mqtt;
#[cfg(target_os = "espidf")]
mod wifi;

use anyhow::Result;
use log::{error, info};

use crate::config::{Config, ConfigSource};
use crate::display::TextPanel;
use crate::supervisor::Supervisor;
use crate::timing::Interrupt;
use crate::ui::Ui;

fn load_config(sources: &[&dyn ConfigSource]) -> Result<Config> {
    match Config::load(sources) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            error!("configuration: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use std::sync::{Arc, Mutex};

    use esp_idf_hal::gpio::OutputPin;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("BOOT: matrix-clock v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Peripherals ──
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // ── 2. Config (NVS, then compiled-in secrets) ──
    let nvs = Arc::new(Mutex::new(EspNvs::new(nvs_partition, config::NS, true)?));
    let nvs_source = config::NvsSource::new(nvs.clone());
    let cfg = load_config(&[&nvs_source, &config::CompiledSecrets])?;

    // ── 3. Console ──
    let interrupt = Interrupt::new();
    let settings = console::Settings {
        sources: vec![Box::new(nvs_source.clone()), Box::new(config::CompiledSecrets)],
        store: Some(Box::new(nvs_source)),
    };
    console::spawn_console(interrupt.clone(), settings);

    // ── 4. Radio, broker client, display ──
    let radio = wifi::EspRadio::new(peripherals.modem, sysloop)?;
    let transport = mqtt::EspMqttTransport::new();
    let led = board::GpioIndicator::new(peripherals.pins.gpio13.downgrade_output())?;
    let panel = TextPanel::new().with_indicator(Box::new(led));
    let ui = Ui::new(panel, board::EspTimer)
        .with_rtc(Box::new(board::SystemRtc))
        .with_interrupt(interrupt);

    // ── 5. Main loop ──
    let store = Box::new(board::NvsErrorStore::new(nvs));
    let mut supervisor = Supervisor::new(&cfg, radio, transport, ui, store);
    supervisor.run();
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use crate::session::Topics;
    use crate::sim::{ScriptedRadio, ScriptedTransport};
    use crate::timing::StdMonotonic;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("BOOT: matrix-clock v{} (host simulator)", env!("CARGO_PKG_VERSION"));

    let cfg = load_config(&[&config::EnvSource, &config::CompiledSecrets])?;

    let interrupt = Interrupt::new();
    let settings = console::Settings {
        sources: vec![Box::new(config::EnvSource), Box::new(config::CompiledSecrets)],
        store: None,
    };
    console::spawn_console(interrupt.clone(), settings);

    let topics = Topics::new(&cfg.topic_base, &cfg.device_id);
    let transport = ScriptedTransport::loopback(topics.time(), Box::new(board::epoch_ms));
    let ui = Ui::new(TextPanel::new(), StdMonotonic::new()).with_interrupt(interrupt);
    let store = Box::new(board::FileErrorStore::new(board::ERROR_FILE));

    let mut supervisor = Supervisor::new(&cfg, ScriptedRadio::new(), transport, ui, store);
    supervisor.run();
    Ok(())
}
