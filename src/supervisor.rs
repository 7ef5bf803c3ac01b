use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};

use crate::clock::format_timestamp;
use crate::config::Config;
use crate::display::StatusDisplay;
use crate::link::{Credentials, LinkManager, LinkStatus, Radio};
use crate::session::{BrokerOptions, Readiness, Restart, SessionManager, Topics, Transport};
use crate::time_sync::{TimeSync, RESYNC_INTERVAL_MS};
use crate::timing::{duration_ms, Monotonic};
use crate::ui::Ui;

/// Durable home for the last unhandled loop error.
pub trait ErrorStore {
    /// Storage is held elsewhere (e.g. an attached debug session).
    fn is_busy(&self) -> bool;

    fn write(&mut self, record: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub tick: Duration,
    pub idle: Duration,
    pub restart_cooldown: Duration,
    pub settle: Duration,
    pub loop_error_pause: Duration,
    pub fault_pause: Duration,
    pub resync_interval_ms: i64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            idle: Duration::from_secs(1),
            restart_cooldown: Duration::from_secs(15),
            settle: Duration::from_secs(1),
            loop_error_pause: Duration::from_secs(60),
            fault_pause: Duration::from_secs(48 * 60 * 60),
            resync_interval_ms: RESYNC_INTERVAL_MS,
        }
    }
}

/// How one guarded iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iteration {
    Completed,
    /// The tick failed; the error was recorded and the loop paused.
    Recovered,
    /// Handling the failure failed too; the long pause was taken.
    Faulted,
}

pub struct Supervisor<R, T, D, M> {
    link: LinkManager<R>,
    session: SessionManager<T>,
    sync: TimeSync,
    ui: Ui<D, M>,
    store: Box<dyn ErrorStore>,
    timings: Timings,
    restarts: u32,
}

impl<R, T, D, M> Supervisor<R, T, D, M>
where
    R: Radio,
    T: Transport,
    D: StatusDisplay,
    M: Monotonic,
{
    pub fn new(
        cfg: &Config,
        radio: R,
        transport: T,
        ui: Ui<D, M>,
        store: Box<dyn ErrorStore>,
    ) -> Self {
        let credentials = Credentials {
            ssid: cfg.wifi_ssid.clone(),
            password: cfg.wifi_pass.clone(),
        };
        let timings = Timings::default();
        Self {
            link: LinkManager::new(radio, credentials, cfg.color_wifi, cfg.color_nowifi),
            session: SessionManager::new(
                transport,
                BrokerOptions::from_config(cfg),
                Topics::new(&cfg.topic_base, &cfg.device_id),
            ),
            sync: TimeSync::new(timings.resync_interval_ms),
            ui,
            store,
            timings,
            restarts: 0,
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self.sync = TimeSync::new(timings.resync_interval_ms);
        self
    }

    pub fn link(&self) -> &LinkManager<R> {
        &self.link
    }

    pub fn session(&self) -> &SessionManager<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager<T> {
        &mut self.session
    }

    pub fn sync(&self) -> &TimeSync {
        &self.sync
    }

    pub fn ui(&self) -> &Ui<D, M> {
        &self.ui
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Run until the user interrupts.
    pub fn run(&mut self) {
        info!("supervisor: running");
        while !self.ui.interrupted() {
            self.iterate();
        }
        info!("supervisor: stopped by user");
        self.ui.warning("Stopped");
    }

    /// One tick behind the top-level guard.
    pub fn iterate(&mut self) -> Iteration {
        let err = match self.tick() {
            Ok(()) => return Iteration::Completed,
            Err(e) => e,
        };
        match self.recover(&err) {
            Ok(()) => Iteration::Recovered,
            Err(fault) => {
                error!("LOOP INTERNAL ERROR: {:#} (while handling: {:#})", fault, err);
                self.ui
                    .error(&format!("LOOP INTERNAL ERROR: {}", one_line(&fault)));
                self.ui.wait(self.timings.fault_pause);
                Iteration::Faulted
            }
        }
    }

    /// Link, then session, then time sync; then pace to the tick period.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        let started = self.ui.now_ms();
        self.ui.refresh();

        let link = self.link.ensure_connected(&mut self.ui)?;
        if link == LinkStatus::Established {
            // A new association invalidates any session state.
            self.session.reset();
        }

        let readiness = self.session.ensure_ready(link.is_up(), &mut self.ui)?;
        let ok = readiness.is_ready();
        let restart = match readiness {
            Readiness::JustConnected => self.sync.request(&mut self.session, &mut self.ui)?,
            Readiness::Ready => self.sync.maybe_resync(&mut self.session, &mut self.ui)?,
            Readiness::NotReady => None,
            Readiness::Restart(r) => Some(r),
        };

        if let Some(restart) = restart {
            return self.restart_stack(restart);
        }

        if ok {
            let elapsed = self.ui.now_ms() - started;
            let remaining = duration_ms(self.timings.tick) - elapsed;
            if remaining > 0 {
                self.ui.wait(Duration::from_millis(remaining as u64));
            }
        } else {
            self.ui.wait(self.timings.idle);
        }
        Ok(())
    }

    /// Cool down, drop the link and start link and session over in place.
    pub fn restart_stack(&mut self, restart: Restart) -> anyhow::Result<()> {
        warn!(
            "restarting network stack ({}): {}",
            if restart.hard_reset { "hard" } else { "soft" },
            restart.reason
        );
        self.ui.wait(self.timings.restart_cooldown);

        self.ui.error("WiFi Reconnect");
        self.link.drop_link(restart.hard_reset, &mut self.ui)?;

        info!("Soft Rebooting");
        self.ui.warning("Soft Rebooting");
        self.ui.wait(self.timings.settle);

        self.session.reset();
        self.sync = TimeSync::new(self.timings.resync_interval_ms);
        self.restarts += 1;
        Ok(())
    }

    fn recover(&mut self, err: &anyhow::Error) -> anyhow::Result<()> {
        error!("LOOP ERROR: {:?}", err);

        if self.store.is_busy() {
            warn!("error record not written, storage is busy");
        } else {
            let record = error_record(&format_timestamp(&self.ui.local_time()), err);
            self.store
                .write(&record)
                .context("writing error record")?;
        }

        self.ui.error(&format!("LOOP ERROR: {}", one_line(err)));
        self.ui.wait(self.timings.loop_error_pause);
        Ok(())
    }
}

/// Timestamp line followed by the error chain, outermost first.
pub fn error_record(timestamp: &str, err: &anyhow::Error) -> String {
    let mut record = String::new();
    let _ = writeln!(record, "{}", timestamp);
    for cause in err.chain() {
        let _ = writeln!(record, "{}", cause);
    }
    record
}

fn one_line(err: &anyhow::Error) -> String {
    format!("{:#}", err).replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::{self, Rgb};
    use crate::error::NetworkError;
    use crate::link::LinkState;
    use crate::session::SessionState;
    use crate::sim::{
        DisplayEvent, MemoryStore, RadioCall, RecordingDisplay, ScriptedRadio,
        ScriptedTransport, SimClock,
    };
    use anyhow::anyhow;

    type Sim<'a> = Supervisor<ScriptedRadio, ScriptedTransport, RecordingDisplay, &'a SimClock>;

    fn config() -> Config {
        Config {
            wifi_ssid: "home".into(),
            wifi_pass: "hunter2".into(),
            mqtt_broker: "broker.local".into(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_pass: None,
            device_id: "kitchen".into(),
            topic_base: "matrix_clock".into(),
            color_wifi: Rgb(0x000000),
            color_nowifi: Rgb(0x330000),
            keep_alive_secs: 12,
        }
    }

    fn supervisor<'a>(
        clock: &'a SimClock,
        radio: ScriptedRadio,
        transport: ScriptedTransport,
        store: MemoryStore,
    ) -> Sim<'a> {
        let ui = Ui::new(RecordingDisplay::new(), clock);
        Supervisor::new(&config(), radio, transport, ui, Box::new(store))
    }

    fn count(log: &[String], entry: &str) -> usize {
        log.iter().filter(|l| l.as_str() == entry).count()
    }

    #[test]
    fn link_retries_then_session_comes_up_and_requests_time() {
        let clock = SimClock::new();
        let radio = ScriptedRadio::new()
            .fail_next(NetworkError::Timeout)
            .fail_next(NetworkError::AssociationFailed("auth".into()));
        let mut sup = supervisor(&clock, radio, ScriptedTransport::new(), MemoryStore::new());

        assert_eq!(sup.iterate(), Iteration::Completed);
        assert_eq!(sup.link().state(), &LinkState::Disconnected);
        assert_eq!(sup.session().state(), SessionState::Disconnected);
        // idle wait while down
        assert_eq!(clock.now_ms(), 1_000);

        sup.iterate();
        assert!(!sup.link().is_connected());
        assert!(sup.session().transport().log().is_empty());

        sup.iterate();
        assert!(sup.link().is_connected());
        assert_eq!(sup.session().state(), SessionState::Ready);
        assert_eq!(
            sup.session().transport().log(),
            &[
                "disconnect".to_string(),
                "connect matrix-clock-kitchen".to_string(),
                "subscribe matrix_clock/kitchen/#".to_string(),
                "subscribe matrix_clock/time".to_string(),
                "poll".to_string(),
                "publish matrix_clock/time".to_string(),
            ]
        );
        assert_eq!(
            sup.session().transport().published(),
            &[("matrix_clock/time".to_string(), String::new())]
        );
        assert_eq!(sup.sync().last_attempt_ms(), Some(2_000));
        // connected ticks are paced to the tick period
        assert_eq!(clock.now_ms(), 2_200);

        let texts = sup.ui().display().status_texts();
        assert_eq!(
            &texts[texts.len() - 4..],
            &[
                "Connecting WiFi".to_string(),
                "WiFi Connected".to_string(),
                "Connecting MQTT".to_string(),
                " ".to_string(),
            ]
        );
    }

    #[test]
    fn time_sync_rate_limit_holds_across_ticks() {
        let clock = SimClock::new();
        let mut sup = supervisor(
            &clock,
            ScriptedRadio::new(),
            ScriptedTransport::new(),
            MemoryStore::new(),
        );
        while clock.now_ms() < 150_000 {
            assert_eq!(sup.iterate(), Iteration::Completed);
        }
        let log = sup.session().transport().log();
        assert_eq!(count(log, "publish matrix_clock/time"), 3);
        assert_eq!(count(log, "connect matrix-clock-kitchen"), 1);
    }

    #[test]
    fn publish_failure_hard_restarts_after_cooldown() {
        let clock = SimClock::new();
        let mut sup = supervisor(
            &clock,
            ScriptedRadio::new(),
            ScriptedTransport::new(),
            MemoryStore::new(),
        );
        sup.iterate();
        assert!(sup.session().is_ready());

        clock.advance(60_000);
        sup.session_mut()
            .transport_mut()
            .fail_publish(NetworkError::SendFailed("ECONNRESET".into()));
        let before = clock.now_ms();
        assert_eq!(sup.iterate(), Iteration::Completed);

        // cooldown, two drop steps and the settle pause
        assert!(clock.now_ms() - before >= 18_000);
        assert_eq!(sup.restarts(), 1);
        assert_eq!(sup.session().state(), SessionState::Disconnected);
        assert_eq!(sup.link().state(), &LinkState::Disconnected);
        assert_eq!(sup.link().radio().calls().last(), Some(&RadioCall::Reset));

        let statuses = sup.ui().display().status_events();
        let tail: Vec<_> = statuses[statuses.len() - 6..]
            .iter()
            .map(|(_, text, color)| (text.as_str(), *color))
            .collect();
        assert_eq!(
            tail,
            vec![
                ("MQTT ERROR: send failed: ECONNRESET", Some(color::ERROR)),
                ("Time Sync Request Failed: send failed: ECONNRESET", Some(color::ERROR)),
                ("WiFi Reconnect", Some(color::ERROR)),
                ("WiFi D/Cing", Some(color::WARNING)),
                ("WiFi D/Ced", Some(color::WARNING)),
                ("Soft Rebooting", Some(color::WARNING)),
            ]
        );

        // next tick brings everything back and asks for time again
        sup.iterate();
        assert!(sup.session().is_ready());
        assert_eq!(
            count(sup.session().transport().log(), "publish matrix_clock/time"),
            3
        );
    }

    #[test]
    fn connect_failure_soft_restarts() {
        let clock = SimClock::new();
        let transport = ScriptedTransport::new().fail_connect(NetworkError::Timeout);
        let mut sup = supervisor(&clock, ScriptedRadio::new(), transport, MemoryStore::new());
        sup.iterate();
        assert_eq!(sup.restarts(), 1);
        assert_eq!(
            sup.link().radio().calls().last(),
            Some(&RadioCall::Disassociate)
        );
        assert!(clock.now_ms() >= 15_000);
    }

    #[test]
    fn loop_error_is_recorded_displayed_and_paused() {
        let clock = SimClock::new();
        clock.advance(3_723_000);
        let store = MemoryStore::new();
        let radio = ScriptedRadio::new().fault_next(anyhow!("radio driver panicked"));
        let mut sup = supervisor(&clock, radio, ScriptedTransport::new(), store.clone());

        assert_eq!(sup.iterate(), Iteration::Recovered);
        assert_eq!(
            store.records(),
            vec!["1970-01-01 1:02:03 AM\nradio driver panicked\n".to_string()]
        );
        assert_eq!(
            sup.ui().display().status_texts().last().map(String::as_str),
            Some("LOOP ERROR: radio driver panicked")
        );
        assert_eq!(clock.now_ms(), 3_723_000 + 60_000);

        // the loop carries on afterwards
        assert_eq!(sup.iterate(), Iteration::Completed);
        assert!(sup.link().is_connected());
    }

    #[test]
    fn busy_store_skips_the_record() {
        let clock = SimClock::new();
        let store = MemoryStore::new().busy();
        let radio = ScriptedRadio::new().fault_next(anyhow!("boom"));
        let mut sup = supervisor(&clock, radio, ScriptedTransport::new(), store.clone());
        assert_eq!(sup.iterate(), Iteration::Recovered);
        assert!(store.records().is_empty());
        assert_eq!(clock.now_ms(), 60_000);
    }

    #[test]
    fn failing_error_handler_takes_the_long_pause() {
        let clock = SimClock::new();
        let store = MemoryStore::new().failing();
        let radio = ScriptedRadio::new().fault_next(anyhow!("boom"));
        let mut sup = supervisor(&clock, radio, ScriptedTransport::new(), store);

        assert_eq!(sup.iterate(), Iteration::Faulted);
        assert!(clock.now_ms() >= 48 * 60 * 60 * 1000);
        assert_eq!(
            sup.ui().display().status_texts().last().map(String::as_str),
            Some("LOOP INTERNAL ERROR: writing error record: flash write failed")
        );
    }

    #[test]
    fn interrupt_stops_run() {
        let clock = SimClock::new();
        let stop = crate::timing::Interrupt::new();
        let ui = Ui::new(RecordingDisplay::new(), &clock).with_interrupt(stop.clone());
        stop.trigger();
        let mut sup = Supervisor::new(
            &config(),
            ScriptedRadio::new(),
            ScriptedTransport::new(),
            ui,
            Box::new(MemoryStore::new()),
        );
        sup.run();
        assert!(matches!(
            sup.ui().display().events().last(),
            Some(DisplayEvent::Line(_, text, _)) if text == "Stopped"
        ));
    }

    #[test]
    fn error_record_lists_the_chain() {
        let err = anyhow!("socket closed").context("publishing time request");
        assert_eq!(
            error_record("2024-05-06 12:53:20 PM", &err),
            "2024-05-06 12:53:20 PM\npublishing time request\nsocket closed\n"
        );
    }
}
