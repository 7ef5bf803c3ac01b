use std::time::Duration;

use log::{error, info, warn};

use crate::color::Rgb;
use crate::display::StatusDisplay;
use crate::error::NetworkError;
use crate::timing::Monotonic;
use crate::ui::Ui;

/// Pause between the warning steps of a link drop.
const DROP_STEP: Duration = Duration::from_secs(1);

/// Association details reported by the radio.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub ssid: String,
    pub rssi: i8,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected(LinkInfo),
}

/// Wireless radio driver.
///
/// Transient failures must be reported as [`NetworkError`]; any other error is
/// treated as a fault and propagated.
pub trait Radio {
    fn is_connected(&mut self) -> bool;

    /// Make a single association attempt.
    fn associate(&mut self, ssid: &str, password: &str) -> anyhow::Result<LinkInfo>;

    /// Soft disassociation.
    fn disassociate(&mut self) -> anyhow::Result<()>;

    /// Full radio reset. Slower, clears more state.
    fn reset(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

/// Result of [`LinkManager::ensure_connected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    /// Connected before this call.
    Up,
    /// Connected by this call; dependent sessions must start over.
    Established,
    /// Still disconnected after one attempt.
    Down(NetworkError),
}

impl LinkStatus {
    pub fn is_up(&self) -> bool {
        !matches!(self, LinkStatus::Down(_))
    }
}

/// Owns the association lifecycle of the radio.
pub struct LinkManager<R> {
    radio: R,
    state: LinkState,
    credentials: Credentials,
    color_connected: Rgb,
    color_disconnected: Rgb,
}

impl<R: Radio> LinkManager<R> {
    pub fn new(
        radio: R,
        credentials: Credentials,
        color_connected: Rgb,
        color_disconnected: Rgb,
    ) -> Self {
        Self {
            radio,
            state: LinkState::Disconnected,
            credentials,
            color_connected,
            color_disconnected,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected(_))
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Make sure the radio is associated, trying at most once.
    pub fn ensure_connected<D: StatusDisplay, M: Monotonic>(
        &mut self,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<LinkStatus> {
        if self.radio.is_connected() {
            if self.is_connected() {
                ui.set_indicator(self.color_connected);
                return Ok(LinkStatus::Up);
            }
            // Radio came up on its own, adopt it below through a fresh attempt
            // so the session restarts cleanly.
        } else if self.is_connected() {
            warn!("WiFi association lost");
            self.state = LinkState::Disconnected;
        }

        info!("Connecting WiFi");
        ui.info("Connecting WiFi");
        self.state = LinkState::Connecting;

        let attempt = self
            .radio
            .associate(&self.credentials.ssid, &self.credentials.password);
        match attempt {
            Ok(link) => {
                ui.set_indicator(self.color_connected);
                info!(
                    "Connected WiFi to {} with RSSI: {} (ip {})",
                    link.ssid,
                    link.rssi,
                    link.ip_address.as_deref().unwrap_or("?")
                );
                ui.success("WiFi Connected");
                self.state = LinkState::Connected(link);
                Ok(LinkStatus::Established)
            }
            Err(e) => {
                self.state = LinkState::Disconnected;
                let err = NetworkError::classify(e)?;
                error!("WiFi Connect Failed: {}", err);
                ui.error(&format!("WiFi Connect Failed: {}", err));
                ui.set_indicator(self.color_disconnected);
                Ok(LinkStatus::Down(err))
            }
        }
    }

    /// Tear the association down; `hard_reset` resets the whole radio.
    pub fn drop_link<D: StatusDisplay, M: Monotonic>(
        &mut self,
        hard_reset: bool,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<()> {
        info!("WiFi D/Cing");
        ui.warning("WiFi D/Cing");
        ui.wait(DROP_STEP);

        let result = if hard_reset {
            info!("Hard resetting radio");
            self.radio.reset()
        } else {
            self.radio.disassociate()
        };
        self.state = LinkState::Disconnected;
        ui.set_indicator(self.color_disconnected);

        match result {
            Ok(()) => {
                info!("WiFi D/Ced");
                ui.warning("WiFi D/Ced");
                ui.wait(DROP_STEP);
            }
            Err(e) => {
                let err = NetworkError::classify(e)?;
                error!("WiFi D/C FAIL: {}", err);
                ui.error(&format!("WiFi D/C FAIL: {}", err));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color;
    use crate::sim::{DisplayEvent, RadioCall, RecordingDisplay, ScriptedRadio, SimClock};
    use anyhow::anyhow;

    const GREEN: Rgb = Rgb(0x000000);
    const RED: Rgb = Rgb(0x330000);

    fn manager(radio: ScriptedRadio) -> LinkManager<ScriptedRadio> {
        let creds = Credentials {
            ssid: "home".into(),
            password: "hunter2".into(),
        };
        LinkManager::new(radio, creds, GREEN, RED)
    }

    #[test]
    fn fails_then_connects_one_attempt_per_call() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let radio = ScriptedRadio::new()
            .fail_next(NetworkError::AssociationFailed("No such ssid".into()))
            .fail_next(NetworkError::Timeout);
        let mut link = manager(radio);

        let first = link.ensure_connected(&mut ui).unwrap();
        assert!(matches!(first, LinkStatus::Down(NetworkError::AssociationFailed(_))));
        assert_eq!(link.state(), &LinkState::Disconnected);
        assert_eq!(ui.display().indicator(), Some(RED));

        let second = link.ensure_connected(&mut ui).unwrap();
        assert_eq!(second, LinkStatus::Down(NetworkError::Timeout));

        let third = link.ensure_connected(&mut ui).unwrap();
        assert_eq!(third, LinkStatus::Established);
        assert!(link.is_connected());
        assert_eq!(ui.display().indicator(), Some(GREEN));

        let fourth = link.ensure_connected(&mut ui).unwrap();
        assert_eq!(fourth, LinkStatus::Up);

        let associations = link
            .radio()
            .calls()
            .iter()
            .filter(|c| matches!(c, RadioCall::Associate(_)))
            .count();
        assert_eq!(associations, 3);

        let texts = ui.display().status_texts();
        assert_eq!(
            texts,
            vec![
                "Connecting WiFi",
                "WiFi Connect Failed: association failed: No such ssid",
                "Connecting WiFi",
                "WiFi Connect Failed: timed out",
                "Connecting WiFi",
                "WiFi Connected",
            ]
        );
    }

    #[test]
    fn lost_association_is_noticed() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut link = manager(ScriptedRadio::new());
        assert_eq!(link.ensure_connected(&mut ui).unwrap(), LinkStatus::Established);

        link.radio.drop_association();
        link.radio.queue_failure(NetworkError::Timeout);
        let status = link.ensure_connected(&mut ui).unwrap();
        assert_eq!(status, LinkStatus::Down(NetworkError::Timeout));
        assert!(!link.is_connected());
    }

    #[test]
    fn soft_drop_shows_warning_steps() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut link = manager(ScriptedRadio::new());
        link.ensure_connected(&mut ui).unwrap();
        ui.display_mut().clear();

        link.drop_link(false, &mut ui).unwrap();
        assert_eq!(link.state(), &LinkState::Disconnected);
        assert_eq!(link.radio().calls().last(), Some(&RadioCall::Disassociate));
        assert_eq!(ui.display().status_texts(), vec!["WiFi D/Cing", "WiFi D/Ced"]);
        assert!(ui
            .display()
            .events()
            .iter()
            .all(|e| !matches!(e, DisplayEvent::Line(_, _, Some(c)) if *c == color::ERROR)));
        assert_eq!(clock.now_ms(), 2_000);
    }

    #[test]
    fn hard_drop_resets_radio() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut link = manager(ScriptedRadio::new());
        link.ensure_connected(&mut ui).unwrap();
        link.drop_link(true, &mut ui).unwrap();
        assert_eq!(link.radio().calls().last(), Some(&RadioCall::Reset));
        assert!(!link.radio().is_associated());
    }

    #[test]
    fn failed_disconnect_is_reported_not_raised() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut link = manager(ScriptedRadio::new().fail_disconnect(NetworkError::Timeout));
        link.ensure_connected(&mut ui).unwrap();
        link.drop_link(false, &mut ui).unwrap();
        assert_eq!(
            ui.display().status_texts().last().map(String::as_str),
            Some("WiFi D/C FAIL: timed out")
        );
        assert_eq!(link.state(), &LinkState::Disconnected);
    }

    #[test]
    fn driver_faults_propagate() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut link = manager(ScriptedRadio::new().fault_next(anyhow!("SPI bus wedged")));
        let err = link.ensure_connected(&mut ui).unwrap_err();
        assert_eq!(err.to_string(), "SPI bus wedged");
        assert_eq!(link.state(), &LinkState::Disconnected);
    }
}
