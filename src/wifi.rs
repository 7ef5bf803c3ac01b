use anyhow::Result;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{
    AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi,
};
use log::{info, warn};

use crate::error::NetworkError;
use crate::link::{LinkInfo, Radio};

/// Log WiFi/AP state from ESP-IDF internals.
fn log_wifi_diag(label: &str) {
    unsafe {
        let mut mode: esp_idf_sys::wifi_mode_t = 0;
        let mode_str = if esp_idf_sys::esp_wifi_get_mode(&mut mode) == esp_idf_sys::ESP_OK {
            match mode {
                x if x == esp_idf_sys::wifi_mode_t_WIFI_MODE_STA => "STA",
                x if x == esp_idf_sys::wifi_mode_t_WIFI_MODE_AP => "AP",
                x if x == esp_idf_sys::wifi_mode_t_WIFI_MODE_APSTA => "AP+STA",
                _ => "?",
            }
        } else {
            "err"
        };

        let mut ap_info: esp_idf_sys::wifi_ap_record_t = core::mem::zeroed();
        let ap_rc = esp_idf_sys::esp_wifi_sta_get_ap_info(&mut ap_info);
        if ap_rc == esp_idf_sys::ESP_OK {
            let ssid = core::str::from_utf8(&ap_info.ssid)
                .unwrap_or("?")
                .trim_end_matches('\0');
            info!(
                "WiFi [{}]: mode={} assoc=YES rssi={} ch={} ssid={}",
                label, mode_str, ap_info.rssi, ap_info.primary, ssid
            );
        } else {
            info!(
                "WiFi [{}]: mode={} assoc=NO (ap_info err={})",
                label, mode_str, ap_rc
            );
        }
    }
}

/// RSSI of the current access point, 0 if not associated.
fn current_rssi() -> i8 {
    unsafe {
        let mut ap_info: esp_idf_sys::wifi_ap_record_t = core::mem::zeroed();
        if esp_idf_sys::esp_wifi_sta_get_ap_info(&mut ap_info) == esp_idf_sys::ESP_OK {
            ap_info.rssi
        } else {
            0
        }
    }
}

/// Station-mode radio. One `associate` call is one connection attempt.
pub struct EspRadio {
    wifi: BlockingWifi<EspWifi<'static>>,
    configured_for: Option<(String, String)>,
}

impl EspRadio {
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self> {
        let esp_wifi = EspWifi::new(modem, sysloop.clone(), None)?;
        let wifi = BlockingWifi::wrap(esp_wifi, sysloop)?;
        Ok(Self {
            wifi,
            configured_for: None,
        })
    }

    fn configure(&mut self, ssid: &str, password: &str) -> Result<()> {
        if self
            .configured_for
            .as_ref()
            .is_some_and(|(s, p)| s == ssid && p == password)
        {
            return Ok(());
        }

        let auth = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let mut wifi_ssid = heapless::String::<32>::new();
        let mut wifi_pass = heapless::String::<64>::new();
        if wifi_ssid.push_str(ssid).is_err() || wifi_pass.push_str(password).is_err() {
            return Err(NetworkError::AssociationFailed("credentials too long".into()).into());
        }

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: wifi_ssid,
                password: wifi_pass,
                auth_method: auth,
                ..Default::default()
            }))?;
        self.configured_for = Some((ssid.to_string(), password.to_string()));
        Ok(())
    }

    fn ip_address(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }
}

impl Radio for EspRadio {
    fn is_connected(&mut self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn associate(&mut self, ssid: &str, password: &str) -> Result<LinkInfo> {
        if self.wifi.is_connected().unwrap_or(false) {
            return Ok(LinkInfo {
                ssid: ssid.to_string(),
                rssi: current_rssi(),
                ip_address: self.ip_address(),
            });
        }

        self.configure(ssid, password)?;
        if !self.wifi.is_started().unwrap_or(false) {
            self.wifi.start()?;
        }

        info!("WiFi connecting to '{}'...", ssid);
        let t0 = unsafe { esp_idf_sys::esp_timer_get_time() };
        if let Err(e) = self.wifi.connect() {
            let elapsed_ms = (unsafe { esp_idf_sys::esp_timer_get_time() } - t0) / 1000;
            warn!("WiFi connect failed after {}ms: {}", elapsed_ms, e);
            log_wifi_diag("connect FAIL");
            let _ = self.wifi.disconnect();
            return Err(NetworkError::AssociationFailed(e.to_string()).into());
        }
        log_wifi_diag("connect OK");

        if let Err(e) = self.wifi.wait_netif_up() {
            warn!("WiFi associated but no IP: {}", e);
            let _ = self.wifi.disconnect();
            return Err(NetworkError::Timeout.into());
        }

        Ok(LinkInfo {
            ssid: ssid.to_string(),
            rssi: current_rssi(),
            ip_address: self.ip_address(),
        })
    }

    fn disassociate(&mut self) -> Result<()> {
        self.wifi
            .disconnect()
            .map_err(|e| NetworkError::SendFailed(e.to_string()).into())
    }

    /// Full stop/start cycle to reset radio state.
    fn reset(&mut self) -> Result<()> {
        let _ = self.wifi.disconnect();
        self.wifi
            .stop()
            .map_err(|e| anyhow::Error::new(NetworkError::SendFailed(e.to_string())))?;
        std::thread::sleep(std::time::Duration::from_millis(500));
        self.wifi
            .start()
            .map_err(|e| anyhow::Error::new(NetworkError::SendFailed(e.to_string())))?;
        std::thread::sleep(std::time::Duration::from_millis(300));
        Ok(())
    }
}
