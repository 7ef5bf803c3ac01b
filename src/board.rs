//! Platform pieces behind the collaborator traits: timer, error record store,
//! RTC and status LED.

#[cfg(target_os = "espidf")]
pub use esp::*;

#[cfg(not(target_os = "espidf"))]
pub use host::*;

/// Cut `record` to at most `max` bytes on a char boundary.
pub fn truncate_record(record: &str, max: usize) -> &str {
    if record.len() <= max {
        return record;
    }
    let mut end = max;
    while !record.is_char_boundary(end) {
        end -= 1;
    }
    &record[..end]
}

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use chrono::NaiveDateTime;
    use esp_idf_hal::gpio::{AnyOutputPin, Output, PinDriver};
    use esp_idf_svc::nvs::{EspNvs, NvsDefault};
    use log::{info, warn};

    use crate::color::Rgb;
    use crate::display::Indicator;
    use crate::supervisor::ErrorStore;
    use crate::timing::Monotonic;
    use crate::ui::Rtc;

    const KEY_LAST_ERROR: &str = "last_error";
    /// NVS string entries are limited to just under 4000 bytes.
    const MAX_RECORD_BYTES: usize = 1024;

    /// `esp_timer` based monotonic clock.
    pub struct EspTimer;

    impl Monotonic for EspTimer {
        fn now_ms(&self) -> i64 {
            (unsafe { esp_idf_sys::esp_timer_get_time() }) / 1000
        }

        fn sleep(&self, duration: Duration) {
            std::thread::sleep(duration);
        }
    }

    /// Keeps the last loop error in NVS.
    pub struct NvsErrorStore {
        nvs: Arc<Mutex<EspNvs<NvsDefault>>>,
    }

    impl NvsErrorStore {
        pub fn new(nvs: Arc<Mutex<EspNvs<NvsDefault>>>) -> Self {
            Self { nvs }
        }
    }

    impl ErrorStore for NvsErrorStore {
        fn is_busy(&self) -> bool {
            false
        }

        fn write(&mut self, record: &str) -> Result<()> {
            let record = super::truncate_record(record, MAX_RECORD_BYTES);
            let mut nvs = self.nvs.lock().map_err(|_| anyhow!("NVS lock poisoned"))?;
            nvs.set_str(KEY_LAST_ERROR, record)?;
            info!("NVS saved {} ({} bytes)", KEY_LAST_ERROR, record.len());
            Ok(())
        }
    }

    /// System time via `settimeofday`, so ESP-IDF's own clock follows along.
    pub struct SystemRtc;

    impl Rtc for SystemRtc {
        fn set(&mut self, t: NaiveDateTime) -> Result<()> {
            let tv = esp_idf_sys::timeval {
                tv_sec: t.and_utc().timestamp() as _,
                tv_usec: 0,
            };
            let rc = unsafe { esp_idf_sys::settimeofday(&tv, core::ptr::null()) };
            if rc != 0 {
                return Err(anyhow!("settimeofday failed ({})", rc));
            }
            Ok(())
        }
    }

    /// Single-color status LED, lit for any non-black color.
    pub struct GpioIndicator {
        pin: PinDriver<'static, AnyOutputPin, Output>,
    }

    impl GpioIndicator {
        pub fn new(pin: AnyOutputPin) -> Result<Self> {
            let mut pin = PinDriver::output(pin)?;
            pin.set_low()?;
            Ok(Self { pin })
        }
    }

    impl Indicator for GpioIndicator {
        fn show(&mut self, color: Rgb) {
            let result = if color.is_off() {
                self.pin.set_low()
            } else {
                self.pin.set_high()
            };
            if let Err(e) = result {
                warn!("status LED: {}", e);
            }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod host {
    use std::io::IsTerminal;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::{Context, Result};
    use log::info;

    use crate::supervisor::ErrorStore;

    pub const ERROR_FILE: &str = "LastError.txt";

    /// Writes the last loop error to a text file. Skipped while a person is
    /// attached to the terminal.
    pub struct FileErrorStore {
        path: PathBuf,
    }

    impl FileErrorStore {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    impl ErrorStore for FileErrorStore {
        fn is_busy(&self) -> bool {
            std::io::stdin().is_terminal()
        }

        fn write(&mut self, record: &str) -> Result<()> {
            std::fs::write(&self.path, record)
                .with_context(|| format!("writing {}", self.path.display()))?;
            info!("wrote {}", self.path.display());
            Ok(())
        }
    }

    /// Host wall clock in epoch milliseconds.
    pub fn epoch_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}
