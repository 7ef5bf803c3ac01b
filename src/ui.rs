use std::time::Duration;

use chrono::{NaiveDateTime, Timelike};
use log::warn;

use crate::clock::{Clock, ClockFace};
use crate::color::{self, Rgb};
use crate::display::{StatusDisplay, StatusLine};
use crate::error::PayloadError;
use crate::timing::{duration_ms, Interrupt, Monotonic};

/// Display refresh period while waiting.
pub const FRAME: Duration = Duration::from_millis(200);

/// Hardware real-time clock kept in step with learned time.
pub trait Rtc {
    fn set(&mut self, t: NaiveDateTime) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn color(self) -> Rgb {
        match self {
            Severity::Success => color::SUCCESS,
            Severity::Info => color::INFO,
            Severity::Warning => color::WARNING,
            Severity::Error => color::ERROR,
        }
    }
}

/// The user-facing side of the device: status display, learned clock and the
/// monotonic timer that paces them. Single owner; every status write goes
/// through here.
pub struct Ui<D, M> {
    display: D,
    timer: M,
    clock: Clock,
    rtc: Option<Box<dyn Rtc>>,
    interrupt: Interrupt,
    shown: Option<(u32, u32)>,
}

impl<D: StatusDisplay, M: Monotonic> Ui<D, M> {
    pub fn new(display: D, timer: M) -> Self {
        Self {
            display,
            timer,
            clock: Clock::new(),
            rtc: None,
            interrupt: Interrupt::new(),
            shown: None,
        }
    }

    pub fn with_rtc(mut self, rtc: Box<dyn Rtc>) -> Self {
        self.rtc = Some(rtc);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn timer(&self) -> &M {
        &self.timer
    }

    pub fn now_ms(&self) -> i64 {
        self.timer.now_ms()
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn local_time(&self) -> NaiveDateTime {
        self.clock.local_time(self.timer.now_ms())
    }

    /// Redraw the clock if the minute changed and advance scroll animation.
    pub fn refresh(&mut self) {
        let t = self.local_time();
        let key = (t.hour(), t.minute());
        if self.shown != Some(key) {
            let face = ClockFace::at(&t);
            self.display.set_clock_text(&face.text, face.color);
            self.shown = Some(key);
        }
        self.display.animate();
    }

    /// Block for `duration` while keeping the display alive. Returns early on
    /// interrupt.
    pub fn wait(&mut self, duration: Duration) {
        let deadline = self.now_ms().saturating_add(duration_ms(duration));
        loop {
            self.refresh();
            let remaining = deadline - self.now_ms();
            if remaining <= 0 || self.interrupted() {
                break;
            }
            let step = remaining.min(duration_ms(FRAME));
            self.timer.sleep(Duration::from_millis(step as u64));
        }
    }

    /// Write a status line; blank text is shown as a single space.
    pub fn set_line(&mut self, line: StatusLine, text: &str, color: Option<Rgb>) {
        let text = if text.is_empty() { " " } else { text };
        self.display.set_line(line, text, color);
    }

    pub fn notify(&mut self, severity: Severity, message: &str) {
        self.set_line(StatusLine::Two, message, Some(severity.color()));
    }

    pub fn success(&mut self, message: &str) {
        self.notify(Severity::Success, message);
    }

    pub fn info(&mut self, message: &str) {
        self.notify(Severity::Info, message);
    }

    pub fn warning(&mut self, message: &str) {
        self.notify(Severity::Warning, message);
    }

    pub fn error(&mut self, message: &str) {
        self.notify(Severity::Error, message);
    }

    pub fn set_indicator(&mut self, color: Rgb) {
        self.display.set_indicator_color(color);
    }

    /// Adopt a broker timestamp. Out-of-range values reset the clock to
    /// time-since-boot instead of leaving a poisoned offset.
    pub fn learn_time(&mut self, epoch_ms: i64) -> Result<NaiveDateTime, PayloadError> {
        let now = self.timer.now_ms();
        self.clock.learn(epoch_ms, now);
        let Some(t) = self.clock.calendar(now) else {
            self.clock.forget();
            self.shown = None;
            return Err(PayloadError::OutOfRange(epoch_ms));
        };
        self.shown = None;
        if let Some(rtc) = self.rtc.as_mut() {
            if let Err(e) = rtc.set(t) {
                warn!("RTC update failed: {:#}", e);
            }
        }
        Ok(t)
    }
}
