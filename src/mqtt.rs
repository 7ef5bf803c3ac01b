use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration, QoS,
};
use log::{debug, info, warn};

use crate::error::{NetworkError, ProtocolError};
use crate::session::{BrokerOptions, Inbound, Transport};

/// How long `connect` waits for the broker's CONNACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PAYLOAD_BYTES: usize = 1024;

enum Event {
    Connected,
    Disconnected,
    Message(Inbound),
    Failed(String),
}

struct Active {
    client: EspMqttClient<'static>,
    events: Receiver<Event>,
}

/// ESP-IDF MQTT client. A fresh client is created per session; a receiver
/// thread forwards connection events to `poll`.
pub struct EspMqttTransport {
    active: Option<Active>,
    connected: Arc<AtomicBool>,
}

impl EspMqttTransport {
    pub fn new() -> Self {
        Self {
            active: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn spawn_receiver(mut conn: EspMqttConnection, tx: Sender<Event>, connected: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                let forwarded = match event.payload() {
                    EventPayload::Connected(_) => {
                        connected.store(true, Ordering::Relaxed);
                        Event::Connected
                    }
                    EventPayload::Disconnected => {
                        connected.store(false, Ordering::Relaxed);
                        Event::Disconnected
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // We only process full MQTT payloads.
                        if !matches!(details, Details::Complete) || data.len() > MAX_PAYLOAD_BYTES {
                            warn!("dropping MQTT payload on {} ({} bytes)", topic, data.len());
                            continue;
                        }
                        Event::Message(Inbound::new(topic, data.to_vec()))
                    }
                    EventPayload::Error(e) => Event::Failed(format!("{:?}", e)),
                    other => {
                        debug!("mqtt event: {:?}", other);
                        continue;
                    }
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            connected.store(false, Ordering::Relaxed);
            debug!("mqtt receiver finished");
        });
    if let Err(e) = spawned {
        warn!("failed to spawn mqtt receiver: {}", e);
    }
}

impl Transport for EspMqttTransport {
    fn is_connected(&mut self) -> bool {
        self.active.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn connect(&mut self, options: &BrokerOptions) -> Result<()> {
        self.disconnect()?;

        let url = options.url();
        let conf = MqttClientConfiguration {
            client_id: Some(options.client_id.as_str()),
            username: options.username.as_deref(),
            password: options.password.as_deref(),
            keep_alive_interval: Some(options.keep_alive),
            network_timeout: options.socket_timeout,
            ..Default::default()
        };
        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|e| ProtocolError::Refused(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        self.connected.store(false, Ordering::Relaxed);
        spawn_receiver(conn, tx, self.connected.clone());

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Event::Connected) => break,
                Ok(Event::Failed(why)) => {
                    warn!("mqtt connect error: {}", why);
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(NetworkError::Timeout.into()),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ProtocolError::Refused("connection closed".into()).into())
                }
            }
        }

        info!("MQTT connected to {}", url);
        self.active = Some(Active { client, events: rx });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.active.take().is_some() {
            info!("MQTT client dropped");
        }
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        let active = self.active.as_mut().ok_or(ProtocolError::NotConnected)?;
        active
            .client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ProtocolError::NotConnected.into());
        }
        let active = self.active.as_mut().ok_or(ProtocolError::NotConnected)?;
        active
            .client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<Inbound>> {
        let active = self.active.as_mut().ok_or(ProtocolError::NotConnected)?;
        let mut messages = Vec::new();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = if messages.is_empty() {
                active.events.recv_timeout(remaining)
            } else {
                active.events.try_recv().map_err(|_| RecvTimeoutError::Timeout)
            };
            match event {
                Ok(Event::Message(msg)) => messages.push(msg),
                Ok(Event::Connected) => {}
                Ok(Event::Disconnected) => return Err(ProtocolError::NotConnected.into()),
                Ok(Event::Failed(why)) => return Err(ProtocolError::Malformed(why).into()),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ProtocolError::NotConnected.into())
                }
            }
        }
        Ok(messages)
    }
}
