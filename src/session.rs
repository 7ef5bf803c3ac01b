use std::time::Duration;

use log::{debug, error, info, warn};

use crate::color;
use crate::config::Config;
use crate::display::{StatusDisplay, StatusLine};
use crate::error::{PayloadError, ProtocolError, SessionError};
use crate::timing::Monotonic;
use crate::ui::Ui;

/// Upper bound on one pump of incoming messages per tick.
pub const PUMP_TIMEOUT: Duration = Duration::from_millis(200);
/// Socket-level timeout handed to the transport.
pub const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Inbound {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub socket_timeout: Duration,
}

impl BrokerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            host: cfg.mqtt_broker.clone(),
            port: cfg.mqtt_port,
            client_id: format!("matrix-clock-{}", cfg.device_id),
            username: cfg.mqtt_user.clone(),
            password: cfg.mqtt_pass.clone(),
            keep_alive: Duration::from_secs(u64::from(cfg.keep_alive_secs)),
            socket_timeout: SOCKET_TIMEOUT,
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

/// Publish/subscribe client beneath the session.
///
/// Transient failures are [`crate::error::NetworkError`] or [`ProtocolError`];
/// anything else propagates as a fault.
pub trait Transport {
    fn is_connected(&mut self) -> bool;

    /// Open a clean session. Subscriptions are not restored.
    fn connect(&mut self, options: &BrokerOptions) -> anyhow::Result<()>;

    fn disconnect(&mut self) -> anyhow::Result<()>;

    /// Subscriptions and publishes are at-most-once.
    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()>;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> anyhow::Result<()>;

    /// Drive protocol I/O for at most `timeout`, returning what arrived.
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Vec<Inbound>>;
}

/// Where an incoming topic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Time,
    Line(StatusLine),
    Ignored,
}

/// Topic table for one device, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    time: String,
    device_tree: String,
    line1: String,
    line2: String,
}

impl Topics {
    pub fn new(base: &str, device_id: &str) -> Self {
        let prefix = format!("{}/{}", base, device_id);
        Self {
            time: format!("{}/time", base),
            device_tree: format!("{}/#", prefix),
            line1: format!("{}/line1", prefix),
            line2: format!("{}/line2", prefix),
        }
    }

    pub fn time(&self) -> &str {
        &self.time
    }

    pub fn device_tree(&self) -> &str {
        &self.device_tree
    }

    pub fn line(&self, line: StatusLine) -> &str {
        match line {
            StatusLine::One => &self.line1,
            StatusLine::Two => &self.line2,
        }
    }

    pub fn route(&self, topic: &str) -> Route {
        if topic == self.time {
            Route::Time
        } else if topic == self.line1 {
            Route::Line(StatusLine::One)
        } else if topic == self.line2 {
            Route::Line(StatusLine::Two)
        } else {
            Route::Ignored
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Ready,
}

/// Request to tear the whole stack down and bring it back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restart {
    pub hard_reset: bool,
    pub reason: SessionError,
}

impl Restart {
    pub fn soft(reason: SessionError) -> Self {
        Self {
            hard_reset: false,
            reason,
        }
    }

    pub fn hard(reason: SessionError) -> Self {
        Self {
            hard_reset: true,
            reason,
        }
    }
}

/// Outcome of [`SessionManager::ensure_ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Session was already up; one pump ran.
    Ready,
    /// Session came up during this call; time should be requested now.
    JustConnected,
    /// Not usable this tick; retry next tick.
    NotReady,
    Restart(Restart),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready | Readiness::JustConnected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed(SessionError),
}

pub struct SessionManager<T> {
    transport: T,
    state: SessionState,
    options: BrokerOptions,
    topics: Topics,
    #[cfg(test)]
    trail: Vec<SessionState>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: T, options: BrokerOptions, topics: Topics) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
            options,
            topics,
            #[cfg(test)]
            trail: Vec::new(),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if next != self.state {
            debug!("session {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        #[cfg(test)]
        self.trail.push(next);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Bring the session to `Ready` if needed, then pump incoming messages
    /// once.
    pub fn ensure_ready<D: StatusDisplay, M: Monotonic>(
        &mut self,
        link_up: bool,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<Readiness> {
        if !link_up {
            self.enter(SessionState::Disconnected);
            return Ok(Readiness::NotReady);
        }

        if self.state == SessionState::Ready && !self.transport.is_connected() {
            warn!("MQTT session lost");
            self.enter(SessionState::Disconnected);
        }

        let mut outcome = Readiness::Ready;
        if self.state != SessionState::Ready {
            if let Some(restart) = self.open(ui)? {
                return Ok(Readiness::Restart(restart));
            }
            outcome = Readiness::JustConnected;
        }

        match self.transport.poll(PUMP_TIMEOUT) {
            Ok(messages) => {
                for msg in messages {
                    self.dispatch(&msg, ui);
                }
                Ok(outcome)
            }
            Err(e) => match SessionError::classify(e)? {
                SessionError::Protocol(ProtocolError::NotConnected) => {
                    warn!("MQTT not connected, will reconnect");
                    self.enter(SessionState::Disconnected);
                    Ok(Readiness::NotReady)
                }
                err => {
                    error!("MQTT ERROR: {}", err);
                    ui.error(&format!("MQTT ERROR: {}", err));
                    self.enter(SessionState::Disconnected);
                    Ok(Readiness::Restart(Restart::soft(err)))
                }
            },
        }
    }

    /// Connect and subscribe. `Some` when the stack must be restarted.
    fn open<D: StatusDisplay, M: Monotonic>(
        &mut self,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<Option<Restart>> {
        info!("Connecting MQTT to {}", self.options.url());
        ui.info("Connecting MQTT");
        self.enter(SessionState::Connecting);
        if let Err(e) = self.transport.connect(&self.options) {
            self.enter(SessionState::Disconnected);
            let err = SessionError::classify(e)?;
            error!("MQTT CONN FAIL: {}", err);
            ui.error(&format!("MQTT CONN FAIL: {}", err));
            return Ok(Some(Restart::soft(err)));
        }

        self.enter(SessionState::Subscribing);
        let topics = [self.topics.device_tree.clone(), self.topics.time.clone()];
        for topic in &topics {
            if let Err(e) = self.transport.subscribe(topic) {
                self.enter(SessionState::Disconnected);
                let err = SessionError::classify(e)?;
                error!("MQTT SUBSCRIBE FAIL {}: {}", topic, err);
                ui.error(&format!("MQTT ERROR: {}", err));
                return Ok(Some(Restart::soft(err)));
            }
            debug!("subscribed {}", topic);
        }

        self.enter(SessionState::Ready);
        info!("MQTT ready as {}", self.options.client_id);
        ui.success("");
        Ok(None)
    }

    /// Non-retained, at-most-once publish. A failure drops the session.
    pub fn publish<D: StatusDisplay, M: Monotonic>(
        &mut self,
        topic: &str,
        payload: &[u8],
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<Delivery> {
        match self.transport.publish(topic, payload, false) {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                let err = SessionError::classify(e)?;
                error!("MQTT publish to {} failed: {}", topic, err);
                ui.error(&format!("MQTT ERROR: {}", err));
                self.enter(SessionState::Disconnected);
                Ok(Delivery::Failed(err))
            }
        }
    }

    /// Forget the session; the next `ensure_ready` starts from scratch.
    pub fn reset(&mut self) {
        if let Err(e) = self.transport.disconnect() {
            debug!("MQTT disconnect: {:#}", e);
        }
        self.enter(SessionState::Disconnected);
    }

    /// Route one message. Problems are logged with context, never raised.
    pub fn dispatch<D: StatusDisplay, M: Monotonic>(&self, msg: &Inbound, ui: &mut Ui<D, M>) {
        let payload = String::from_utf8_lossy(&msg.payload);
        match self.topics.route(&msg.topic) {
            Route::Time => {
                // Our own empty request echoes back on the shared topic.
                if payload.trim().is_empty() {
                    return;
                }
                match parse_time_payload(&payload).and_then(|ms| ui.learn_time(ms)) {
                    Ok(t) => info!(
                        "MQTT Timesync Completed: {}",
                        crate::clock::format_timestamp(&t)
                    ),
                    Err(e) => warn!("ignoring {} payload {:?}: {}", msg.topic, payload, e),
                }
            }
            Route::Line(line) => {
                let (text, color) = color::line_from_payload(&payload);
                ui.set_line(line, text, Some(color));
            }
            Route::Ignored => debug!("ignoring {} ({} bytes)", msg.topic, msg.payload.len()),
        }
    }
}

fn parse_time_payload(payload: &str) -> Result<i64, PayloadError> {
    payload
        .trim()
        .parse::<i64>()
        .map_err(|_| PayloadError::InvalidTimestamp(payload.to_string()))
}
