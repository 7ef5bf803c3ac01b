use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};

use crate::color::{self, Rgb};

/// Wall-clock time derived from the monotonic counter plus a learned offset.
///
/// The offset is 0 until the first time sync, so the clock starts at the
/// epoch at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clock {
    offset_ms: i64,
    last_sync_ms: Option<i64>,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            offset_ms: 0,
            last_sync_ms: None,
        }
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Monotonic timestamp of the last successful sync.
    pub fn last_sync_ms(&self) -> Option<i64> {
        self.last_sync_ms
    }

    /// Epoch milliseconds (local time) at the given monotonic instant.
    pub fn wall_ms(&self, mono_ms: i64) -> i64 {
        mono_ms.saturating_add(self.offset_ms)
    }

    /// Adopt `epoch_ms` as the current time.
    pub fn learn(&mut self, epoch_ms: i64, mono_ms: i64) {
        self.offset_ms = epoch_ms.saturating_sub(mono_ms);
        self.last_sync_ms = Some(mono_ms);
    }

    /// Drop the learned offset, falling back to time-since-boot.
    pub fn forget(&mut self) {
        self.offset_ms = 0;
        self.last_sync_ms = None;
    }

    /// Calendar time, or `None` if the wall time is outside chrono's range.
    pub fn calendar(&self, mono_ms: i64) -> Option<NaiveDateTime> {
        to_calendar(self.wall_ms(mono_ms))
    }

    /// Calendar time, falling back to the raw monotonic-derived time when the
    /// learned offset pushes the value out of range.
    pub fn local_time(&self, mono_ms: i64) -> NaiveDateTime {
        self.calendar(mono_ms)
            .or_else(|| to_calendar(mono_ms))
            .unwrap_or_default()
    }
}

fn to_calendar(epoch_ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(epoch_ms).map(|dt| dt.naive_utc())
}

// ── Face formatting ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meridiem {
    Am,
    Pm,
}

impl Meridiem {
    pub fn as_str(self) -> &'static str {
        match self {
            Meridiem::Am => "AM",
            Meridiem::Pm => "PM",
        }
    }
}

/// 24-hour to 12-hour conversion: 0 → 12 AM, 12 → 12 PM, 13..=23 → h-12 PM.
pub fn twelve_hour(hour24: u32) -> (u32, Meridiem) {
    match hour24 {
        0 => (12, Meridiem::Am),
        1..=11 => (hour24, Meridiem::Am),
        12 => (12, Meridiem::Pm),
        _ => (hour24 - 12, Meridiem::Pm),
    }
}

/// Clock color for the hour: dim orange 6–8 and 18–22, red 22–6, green
/// otherwise. Intervals are half-open on the hour.
pub fn hour_color(hour24: u32) -> Rgb {
    match hour24 {
        6..=7 | 18..=21 => color::CLOCK_DIM,
        0..=5 | 22..=23 => color::CLOCK_NIGHT,
        _ => color::CLOCK_DAY,
    }
}

/// What the big clock shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockFace {
    pub text: String,
    pub color: Rgb,
    pub meridiem: Meridiem,
}

impl ClockFace {
    pub fn new(hour24: u32, minute: u32) -> Self {
        let (hour12, meridiem) = twelve_hour(hour24);
        Self {
            text: format!("{}:{:02}", hour12, minute),
            color: hour_color(hour24),
            meridiem,
        }
    }

    pub fn at(t: &NaiveDateTime) -> Self {
        Self::new(t.hour(), t.minute())
    }
}

/// `YYYY-MM-DD h:mm:ss AM`, the first line of a persisted error record.
pub fn format_timestamp(t: &NaiveDateTime) -> String {
    let (hour12, meridiem) = twelve_hour(t.hour());
    format!(
        "{:04}-{:02}-{:02} {}:{:02}:{:02} {}",
        t.year(),
        t.month(),
        t.day(),
        hour12,
        t.minute(),
        t.second(),
        meridiem.as_str()
    )
}
