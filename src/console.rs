use anyhow::Result;
use log::{info, warn};
use std::io::{self, Read};

use crate::config::{self, ConfigSource, SettingsStore};
use crate::timing::Interrupt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Stop,
    Reboot,
    Show,
    Set { key: String, value: String },
    Clear { key: String },
    Unknown(String),
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Command> {
    let clean = line.trim().trim_end_matches('\\');
    if clean.is_empty() {
        return None;
    }
    let mut parts = clean.splitn(3, char::is_whitespace);
    let cmd = parts.next().unwrap_or("");
    let sub = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    let command = match cmd {
        "help" | "?" => Command::Help,
        "stop" | "quit" | "exit" => Command::Stop,
        "reboot" => Command::Reboot,
        "config" | "cfg" => {
            let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match sub {
                "" | "show" => Command::Show,
                "set" if !key.is_empty() => Command::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                },
                "clear" if !key.is_empty() => Command::Clear {
                    key: key.to_string(),
                },
                _ => Command::Unknown(clean.to_string()),
            }
        }
        _ => Command::Unknown(cmd.to_string()),
    };
    Some(command)
}

/// Settings the console can show, and optionally change.
pub struct Settings {
    pub sources: Vec<Box<dyn ConfigSource + Send>>,
    pub store: Option<Box<dyn SettingsStore + Send>>,
}

pub fn spawn_console(interrupt: Interrupt, settings: Settings) {
    let spawned = std::thread::Builder::new()
        .name("console".into())
        .stack_size(8192)
        .spawn(move || {
            let Settings { sources: owned, mut store } = settings;
            let sources: Vec<&dyn ConfigSource> =
                owned.iter().map(|s| &**s as &dyn ConfigSource).collect();
            info!("console: ready (type 'help')");
            let stdin = io::stdin();
            let mut reader = stdin.lock();
            let mut line = String::new();
            let mut buf = [0u8; 1];
            let mut in_escape = false;
            loop {
                match reader.read(&mut buf) {
                    Ok(1) => {
                        let ch = buf[0];
                        if in_escape {
                            if (ch as char).is_ascii_alphabetic() || ch == b'~' {
                                in_escape = false;
                            }
                            continue;
                        }
                        if ch == 0x1b {
                            in_escape = true;
                            continue;
                        }
                        if ch == b'\n' || ch == b'\r' {
                            if line.is_empty() {
                                continue;
                            }
                            info!("> {}", line);
                            if let Some(cmd) = parse(&line) {
                                if let Err(e) = execute(cmd, &interrupt, &sources, store.as_deref_mut()) {
                                    warn!("console: error: {}", e);
                                }
                            }
                            line.clear();
                        } else if ch == 0x7f || ch == 0x08 {
                            line.pop();
                        } else if ch >= 0x20 {
                            line.push(ch as char);
                        }
                    }
                    Ok(_) => {
                        // The host sees a real EOF; the UART driver just has no data yet.
                        if cfg!(not(target_os = "espidf")) {
                            info!("console: stdin closed");
                            break;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("console: not started: {}", e);
    }
}

fn execute(
    cmd: Command,
    interrupt: &Interrupt,
    sources: &[&dyn ConfigSource],
    store: Option<&mut (dyn SettingsStore + Send + 'static)>,
) -> Result<()> {
    match cmd {
        Command::Help => print_help(),
        Command::Stop => {
            info!("console: stop requested");
            interrupt.trigger();
        }
        Command::Reboot => reboot(),
        Command::Show => {
            for line in config::describe(sources) {
                info!("  {}", line);
            }
        }
        Command::Set { key, value } => {
            if let Some(store) = writable(store, &key) {
                store.set(&key, &value)?;
                info!("type 'reboot' to apply");
            }
        }
        Command::Clear { key } => {
            if let Some(store) = writable(store, &key) {
                store.remove(&key)?;
                info!("type 'reboot' to apply");
            }
        }
        Command::Unknown(cmd) => {
            warn!("console: unknown command '{}' (type 'help')", cmd);
        }
    }
    Ok(())
}

/// The store, if there is one and `key` is a known setting.
fn writable<'a>(
    store: Option<&'a mut (dyn SettingsStore + Send + 'static)>,
    key: &str,
) -> Option<&'a mut (dyn SettingsStore + Send + 'static)> {
    let Some(store) = store else {
        warn!("console: settings are read-only here");
        return None;
    };
    if !config::KEYS.contains(&key) {
        warn!("console: unknown setting '{}' (see 'config show')", key);
        return None;
    }
    Some(store)
}

fn print_help() {
    info!("commands:");
    info!("  config show                - list current settings");
    info!("  config set <key> <value>   - store a setting");
    info!("  config clear <key>         - remove a stored setting");
    info!("  stop                       - stop the clock loop");
    info!("  reboot                     - reboot device");
}

#[cfg(target_os = "espidf")]
fn reboot() {
    info!("console: rebooting now");
    std::thread::sleep(std::time::Duration::from_millis(100));
    unsafe { esp_idf_sys::esp_restart() };
}

#[cfg(not(target_os = "espidf"))]
fn reboot() {
    warn!("console: reboot is only available on the device, use 'stop'");
}
