use log::{debug, error, info};

use crate::display::StatusDisplay;
use crate::session::{Delivery, Restart, SessionManager, Transport};
use crate::timing::Monotonic;
use crate::ui::Ui;

/// Minimum spacing between two time requests.
pub const RESYNC_INTERVAL_MS: i64 = 60_000;

/// Asks the broker for the time: right after the session comes up and then
/// once per interval.
///
/// The attempt is recorded before publishing, so a broker that never answers
/// still sees at most one request per interval. A valid reply on the shared
/// time topic, ours or one another clock asked for, also restarts the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSync {
    interval_ms: i64,
    last_attempt_ms: Option<i64>,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new(RESYNC_INTERVAL_MS)
    }
}

impl TimeSync {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            last_attempt_ms: None,
        }
    }

    pub fn last_attempt_ms(&self) -> Option<i64> {
        self.last_attempt_ms
    }

    /// `synced_ms` is when the clock last learned the time, if ever.
    pub fn due(&self, now_ms: i64, synced_ms: Option<i64>) -> bool {
        match self.last_attempt_ms.max(synced_ms) {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        }
    }

    /// Request time if the interval has passed and the session is ready.
    pub fn maybe_resync<T: Transport, D: StatusDisplay, M: Monotonic>(
        &mut self,
        session: &mut SessionManager<T>,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<Option<Restart>> {
        if !session.is_ready() || !self.due(ui.now_ms(), ui.clock().last_sync_ms()) {
            return Ok(None);
        }
        self.request(session, ui)
    }

    /// Publish an empty request on the shared time topic now.
    ///
    /// A failed publish asks for a hard restart of the stack.
    pub fn request<T: Transport, D: StatusDisplay, M: Monotonic>(
        &mut self,
        session: &mut SessionManager<T>,
        ui: &mut Ui<D, M>,
    ) -> anyhow::Result<Option<Restart>> {
        let now = ui.now_ms();
        if !self.due(now, ui.clock().last_sync_ms()) {
            debug!("time request skipped, within {} ms of the last sync", self.interval_ms);
            return Ok(None);
        }
        self.last_attempt_ms = Some(now);

        let topic = session.topics().time().to_string();
        match session.publish(&topic, b"", ui)? {
            Delivery::Sent => {
                info!("MQTT Timesync Requested");
                Ok(None)
            }
            Delivery::Failed(err) => {
                error!("Time Sync Request Failed: {}", err);
                ui.error(&format!("Time Sync Request Failed: {}", err));
                Ok(Some(Restart::hard(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::session::{BrokerOptions, Topics, SOCKET_TIMEOUT};
    use crate::sim::{RecordingDisplay, ScriptedTransport, SimClock};
    use std::time::Duration;

    fn ready_session<M: Monotonic>(
        ui: &mut Ui<RecordingDisplay, M>,
    ) -> SessionManager<ScriptedTransport> {
        let options = BrokerOptions {
            host: "broker.local".into(),
            port: 1883,
            client_id: "matrix-clock-kitchen".into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(12),
            socket_timeout: SOCKET_TIMEOUT,
        };
        let mut s = SessionManager::new(
            ScriptedTransport::new(),
            options,
            Topics::new("matrix_clock", "kitchen"),
        );
        s.ensure_ready(true, ui).unwrap();
        s
    }

    #[test]
    fn at_most_one_request_per_window() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut session = ready_session(&mut ui);
        let mut sync = TimeSync::default();

        // 200 ms ticks for just under three minutes
        let mut stamps = Vec::new();
        for _ in 0..890 {
            let before = session.transport().published().len();
            assert_eq!(sync.maybe_resync(&mut session, &mut ui).unwrap(), None);
            if session.transport().published().len() > before {
                stamps.push(clock.now_ms());
            }
            clock.advance(200);
        }
        assert_eq!(stamps, vec![0, 60_000, 120_000]);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= RESYNC_INTERVAL_MS);
        }
    }

    #[test]
    fn immediate_request_still_honours_window() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut session = ready_session(&mut ui);
        let mut sync = TimeSync::default();

        sync.request(&mut session, &mut ui).unwrap();
        clock.advance(1_000);
        sync.request(&mut session, &mut ui).unwrap();
        assert_eq!(session.transport().published().len(), 1);
    }

    #[test]
    fn reply_pushes_next_request_back() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut session = ready_session(&mut ui);
        let mut sync = TimeSync::default();

        sync.maybe_resync(&mut session, &mut ui).unwrap();
        clock.advance(30_000);
        // another clock asked; the answer reaches us too
        ui.learn_time(1_715_000_000_000).unwrap();

        clock.advance(30_000);
        sync.maybe_resync(&mut session, &mut ui).unwrap();
        assert_eq!(session.transport().published().len(), 1);
        assert!(!sync.due(clock.now_ms(), ui.clock().last_sync_ms()));

        clock.advance(30_000);
        sync.maybe_resync(&mut session, &mut ui).unwrap();
        assert_eq!(session.transport().published().len(), 2);
        assert_eq!(sync.last_attempt_ms(), Some(90_000));
    }

    #[test]
    fn out_of_range_reply_does_not_count_as_sync() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let sync = TimeSync::default();
        clock.advance(5_000);
        assert!(ui.learn_time(i64::MAX).is_err());
        assert!(sync.due(clock.now_ms(), ui.clock().last_sync_ms()));
    }

    #[test]
    fn not_ready_session_is_skipped() {
        let clock = SimClock::new();
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut session = ready_session(&mut ui);
        session.ensure_ready(false, &mut ui).unwrap();
        let mut sync = TimeSync::default();
        assert_eq!(sync.maybe_resync(&mut session, &mut ui).unwrap(), None);
        assert_eq!(sync.last_attempt_ms(), None);
    }

    #[test]
    fn publish_failure_asks_for_hard_restart() {
        let clock = SimClock::new();
        clock.advance(7_000);
        let mut ui = Ui::new(RecordingDisplay::new(), &clock);
        let mut session = ready_session(&mut ui);
        session
            .transport_mut()
            .fail_publish(NetworkError::SendFailed("ECONNRESET".into()));
        let mut sync = TimeSync::default();

        let restart = sync.maybe_resync(&mut session, &mut ui).unwrap().unwrap();
        assert!(restart.hard_reset);
        assert_eq!(sync.last_attempt_ms(), Some(7_000));
        assert_eq!(
            ui.display().status_texts().last().map(String::as_str),
            Some("Time Sync Request Failed: send failed: ECONNRESET")
        );
    }
}
