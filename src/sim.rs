//! Deterministic stand-ins for the hardware collaborators.
//!
//! Used by the unit tests and by the host build, which runs the real
//! supervisor against a simulated radio and a loopback broker.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info};

use crate::color::Rgb;
use crate::display::{StatusDisplay, StatusLine};
use crate::error::{NetworkError, ProtocolError};
use crate::link::{LinkInfo, Radio};
use crate::session::{BrokerOptions, Inbound, Transport};
use crate::supervisor::ErrorStore;
use crate::timing::{duration_ms, Monotonic};

// ── Time ──

/// Virtual monotonic clock. `sleep` advances it instantly.
#[derive(Debug, Default)]
pub struct SimClock {
    now_ms: Cell<i64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms.get()
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }
}

impl Monotonic for SimClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration_ms(duration));
    }
}

// ── Display ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    Line(StatusLine, String, Option<Rgb>),
    Clock(String, Rgb),
    Indicator(Rgb),
}

/// Records every display call in order.
#[derive(Debug, Default)]
pub struct RecordingDisplay {
    events: Vec<DisplayEvent>,
    frames: usize,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[DisplayEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.frames = 0;
    }

    /// Number of animation frames driven so far.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn status_events(&self) -> Vec<(StatusLine, String, Option<Rgb>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Line(line, text, color) => Some((*line, text.clone(), *color)),
                _ => None,
            })
            .collect()
    }

    pub fn status_texts(&self) -> Vec<String> {
        self.status_events()
            .into_iter()
            .map(|(_, text, _)| text)
            .collect()
    }

    /// Most recent indicator color.
    pub fn indicator(&self) -> Option<Rgb> {
        self.events.iter().rev().find_map(|e| match e {
            DisplayEvent::Indicator(c) => Some(*c),
            _ => None,
        })
    }
}

impl StatusDisplay for RecordingDisplay {
    fn set_line(&mut self, line: StatusLine, text: &str, color: Option<Rgb>) {
        self.events
            .push(DisplayEvent::Line(line, text.to_string(), color));
    }

    fn set_clock_text(&mut self, text: &str, color: Rgb) {
        self.events.push(DisplayEvent::Clock(text.to_string(), color));
    }

    fn set_indicator_color(&mut self, color: Rgb) {
        // The link manager re-asserts the color every tick.
        if self.indicator() != Some(color) {
            self.events.push(DisplayEvent::Indicator(color));
        }
    }

    fn animate(&mut self) {
        self.frames += 1;
    }
}

// ── Radio ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    Associate(String),
    Disassociate,
    Reset,
}

/// Radio whose association results are scripted up front. Associates
/// successfully once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedRadio {
    associated: bool,
    failures: VecDeque<anyhow::Error>,
    disconnect_failure: Option<NetworkError>,
    calls: Vec<RadioCall>,
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(mut self, err: NetworkError) -> Self {
        self.queue_failure(err);
        self
    }

    /// Make an association attempt fail with something that is not a
    /// network error.
    pub fn fault_next(mut self, err: anyhow::Error) -> Self {
        self.failures.push_back(err);
        self
    }

    pub fn fail_disconnect(mut self, err: NetworkError) -> Self {
        self.disconnect_failure = Some(err);
        self
    }

    pub fn queue_failure(&mut self, err: NetworkError) {
        self.failures.push_back(anyhow::Error::new(err));
    }

    /// Simulate the access point going away.
    pub fn drop_association(&mut self) {
        self.associated = false;
    }

    pub fn is_associated(&self) -> bool {
        self.associated
    }

    pub fn calls(&self) -> &[RadioCall] {
        &self.calls
    }

    fn take_disconnect_result(&mut self) -> anyhow::Result<()> {
        match self.disconnect_failure.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Radio for ScriptedRadio {
    fn is_connected(&mut self) -> bool {
        self.associated
    }

    fn associate(&mut self, ssid: &str, _password: &str) -> anyhow::Result<LinkInfo> {
        self.calls.push(RadioCall::Associate(ssid.to_string()));
        if let Some(err) = self.failures.pop_front() {
            self.associated = false;
            return Err(err);
        }
        self.associated = true;
        Ok(LinkInfo {
            ssid: ssid.to_string(),
            rssi: -52,
            ip_address: Some("192.168.4.20".to_string()),
        })
    }

    fn disassociate(&mut self) -> anyhow::Result<()> {
        self.calls.push(RadioCall::Disassociate);
        self.associated = false;
        self.take_disconnect_result()
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.calls.push(RadioCall::Reset);
        self.associated = false;
        self.take_disconnect_result()
    }
}

// ── Broker ──

struct Loopback {
    time_topic: String,
    epoch_ms: Box<dyn Fn() -> i64>,
}

/// In-memory broker connection. Failures are queued per operation and
/// consumed one per call.
#[derive(Default)]
pub struct ScriptedTransport {
    connected: bool,
    connect_failures: VecDeque<anyhow::Error>,
    publish_failures: VecDeque<anyhow::Error>,
    poll_failures: VecDeque<anyhow::Error>,
    inbox: VecDeque<Inbound>,
    subscriptions: Vec<String>,
    published: Vec<(String, String)>,
    log: Vec<String>,
    loopback: Option<Loopback>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a broker that echoes publishes to matching subscriptions
    /// and answers empty requests on `time_topic` with `epoch_ms()`.
    pub fn loopback(time_topic: impl Into<String>, epoch_ms: Box<dyn Fn() -> i64>) -> Self {
        Self {
            loopback: Some(Loopback {
                time_topic: time_topic.into(),
                epoch_ms,
            }),
            ..Self::default()
        }
    }

    pub fn fail_connect<E>(mut self, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.connect_failures.push_back(anyhow::Error::new(err));
        self
    }

    pub fn fail_publish<E>(&mut self, err: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.publish_failures.push_back(anyhow::Error::new(err));
    }

    pub fn fail_poll<E>(&mut self, err: E)
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.poll_failures.push_back(anyhow::Error::new(err));
    }

    pub fn fault_poll(&mut self, err: anyhow::Error) {
        self.poll_failures.push_back(err);
    }

    pub fn deliver(&mut self, msg: Inbound) {
        self.inbox.push_back(msg);
    }

    pub fn drop_connection(&mut self) {
        self.connected = false;
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Successful publishes as `(topic, payload)`.
    pub fn published(&self) -> &[(String, String)] {
        &self.published
    }

    fn subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|filter| match filter.strip_suffix('#') {
            Some(prefix) => topic.starts_with(prefix),
            None => filter == topic,
        })
    }
}

impl Transport for ScriptedTransport {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn connect(&mut self, options: &BrokerOptions) -> anyhow::Result<()> {
        self.log.push(format!("connect {}", options.client_id));
        self.subscriptions.clear();
        if let Some(err) = self.connect_failures.pop_front() {
            self.connected = false;
            return Err(err);
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.log.push("disconnect".to_string());
        self.connected = false;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> anyhow::Result<()> {
        self.log.push(format!("subscribe {}", topic));
        if !self.connected {
            return Err(ProtocolError::NotConnected.into());
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> anyhow::Result<()> {
        self.log.push(format!("publish {}", topic));
        if let Some(err) = self.publish_failures.pop_front() {
            return Err(err);
        }
        if !self.connected {
            return Err(ProtocolError::NotConnected.into());
        }
        if retain {
            return Err(anyhow!("retained publish to {}", topic));
        }
        let text = String::from_utf8_lossy(payload).into_owned();
        self.published.push((topic.to_string(), text));

        let mut replies = Vec::new();
        if let Some(lb) = &self.loopback {
            if payload.is_empty() && topic == lb.time_topic {
                let now = (lb.epoch_ms)();
                debug!("loopback: answering time request with {}", now);
                replies.push(Inbound::new(topic, now.to_string()));
            }
        }
        if self.loopback.is_some() && self.subscribed(topic) {
            self.inbox.push_back(Inbound::new(topic, payload.to_vec()));
        }
        self.inbox.extend(replies);
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> anyhow::Result<Vec<Inbound>> {
        self.log.push("poll".to_string());
        if let Some(err) = self.poll_failures.pop_front() {
            return Err(err);
        }
        if !self.connected {
            return Err(ProtocolError::NotConnected.into());
        }
        Ok(self.inbox.drain(..).collect())
    }
}

// ── Error records ──

/// Error store kept in memory. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Rc<RefCell<Vec<String>>>,
    busy: bool,
    failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage held by someone else; writes must be skipped.
    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    /// Every write fails.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn records(&self) -> Vec<String> {
        self.records.borrow().clone()
    }
}

impl ErrorStore for MemoryStore {
    fn is_busy(&self) -> bool {
        self.busy
    }

    fn write(&mut self, record: &str) -> anyhow::Result<()> {
        if self.failing {
            return Err(anyhow!("flash write failed"));
        }
        info!("error record stored ({} bytes)", record.len());
        self.records.borrow_mut().push(record.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BrokerOptions {
        BrokerOptions {
            host: "localhost".into(),
            port: 1883,
            client_id: "matrix-clock-sim".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(12),
            socket_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn sleeping_advances_virtual_time() {
        let clock = SimClock::new();
        Monotonic::sleep(&clock, Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 250);
    }

    #[test]
    fn loopback_answers_time_requests() {
        let mut t = ScriptedTransport::loopback("matrix_clock/time", Box::new(|| 42));
        t.connect(&options()).unwrap();
        t.subscribe("matrix_clock/time").unwrap();
        t.publish("matrix_clock/time", b"", false).unwrap();
        let got = t.poll(Duration::from_millis(200)).unwrap();
        assert_eq!(
            got,
            vec![
                Inbound::new("matrix_clock/time", ""),
                Inbound::new("matrix_clock/time", "42"),
            ]
        );
    }

    #[test]
    fn wildcard_subscriptions_match_subtopics() {
        let mut t = ScriptedTransport::loopback("x/time", Box::new(|| 0));
        t.connect(&options()).unwrap();
        t.subscribe("x/dev/#").unwrap();
        t.publish("x/dev/line1", b"hi", false).unwrap();
        t.publish("x/other/line1", b"no", false).unwrap();
        let got = t.poll(Duration::ZERO).unwrap();
        assert_eq!(got, vec![Inbound::new("x/dev/line1", "hi")]);
    }

    #[test]
    fn disconnected_transport_refuses_io() {
        let mut t = ScriptedTransport::new();
        let err = t.poll(Duration::ZERO).unwrap_err();
        assert_eq!(
            err.downcast::<ProtocolError>().unwrap(),
            ProtocolError::NotConnected
        );
    }
}
