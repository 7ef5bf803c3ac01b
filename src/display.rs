use log::info;

use crate::color::Rgb;

/// Matrix width in pixels.
pub const MATRIX_WIDTH_PX: i32 = 64;
/// Glyph cell width of the small status font, including spacing.
pub const SMALL_GLYPH_PX: i32 = 4;
/// Characters that fit on a status line without scrolling.
pub const LINE_CHARS: usize = (MATRIX_WIDTH_PX / SMALL_GLYPH_PX) as usize;

/// One of the two small status lines under the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusLine {
    One,
    Two,
}

impl StatusLine {
    pub fn number(self) -> u8 {
        match self {
            StatusLine::One => 1,
            StatusLine::Two => 2,
        }
    }

    fn index(self) -> usize {
        self.number() as usize - 1
    }
}

/// Everything the connection core needs from the screen and status LED.
///
/// Callers never pass an empty string; blank text arrives as `" "`.
pub trait StatusDisplay {
    /// Replace a status line. `None` keeps the line's current color.
    fn set_line(&mut self, line: StatusLine, text: &str, color: Option<Rgb>);

    fn set_clock_text(&mut self, text: &str, color: Rgb);

    fn set_indicator_color(&mut self, color: Rgb);

    /// Advance running animations by one frame.
    fn animate(&mut self) {}
}

/// Horizontal scroll state for a status line that is wider than the matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Marquee {
    offset_px: i32,
}

impl Marquee {
    pub fn offset_px(&self) -> i32 {
        self.offset_px
    }

    pub fn reset(&mut self) {
        self.offset_px = 0;
    }

    /// One frame: shift left by a pixel, wrapping once the whole text has
    /// passed. Short text stays pinned at x = 0.
    pub fn step(&mut self, chars: usize) {
        if chars <= LINE_CHARS {
            self.offset_px = 0;
            return;
        }
        let total_px = i32::try_from(chars).unwrap_or(i32::MAX / SMALL_GLYPH_PX) * SMALL_GLYPH_PX;
        if self.offset_px <= -total_px {
            self.offset_px = 0;
        } else {
            self.offset_px -= 1;
        }
    }
}

/// Status LED on the back of the board.
pub trait Indicator {
    fn show(&mut self, color: Rgb);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineState {
    pub text: String,
    pub color: Rgb,
    pub marquee: Marquee,
}

/// In-memory text model of the matrix: clock, two scrolling status lines and
/// the indicator color. Logs every change.
#[derive(Default)]
pub struct TextPanel {
    clock_text: String,
    clock_color: Rgb,
    lines: [LineState; 2],
    indicator_color: Rgb,
    indicator: Option<Box<dyn Indicator>>,
}

impl TextPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_indicator(mut self, indicator: Box<dyn Indicator>) -> Self {
        self.indicator = Some(indicator);
        self
    }

    pub fn clock(&self) -> (&str, Rgb) {
        (&self.clock_text, self.clock_color)
    }

    pub fn line(&self, line: StatusLine) -> &LineState {
        &self.lines[line.index()]
    }

    pub fn indicator_color(&self) -> Rgb {
        self.indicator_color
    }
}

impl StatusDisplay for TextPanel {
    fn set_line(&mut self, line: StatusLine, text: &str, color: Option<Rgb>) {
        let state = &mut self.lines[line.index()];
        if state.text != text {
            state.text = text.to_string();
            state.marquee.reset();
        }
        if let Some(color) = color {
            state.color = color;
        }
        info!("line{} [{}]: {}", line.number(), state.color, state.text);
    }

    fn set_clock_text(&mut self, text: &str, color: Rgb) {
        if self.clock_text != text || self.clock_color != color {
            self.clock_text = text.to_string();
            self.clock_color = color;
            info!("clock [{}]: {}", color, text);
        }
    }

    fn set_indicator_color(&mut self, color: Rgb) {
        if self.indicator_color != color {
            self.indicator_color = color;
            log::debug!("indicator -> {}", color);
        }
        if let Some(indicator) = self.indicator.as_mut() {
            indicator.show(color);
        }
    }

    fn animate(&mut self) {
        for state in self.lines.iter_mut() {
            state.marquee.step(state.text.chars().count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_does_not_scroll() {
        let mut m = Marquee::default();
        for _ in 0..10 {
            m.step(LINE_CHARS);
        }
        assert_eq!(m.offset_px(), 0);
    }

    #[test]
    fn long_text_scrolls_and_wraps() {
        let mut m = Marquee::default();
        let chars = LINE_CHARS + 1;
        let total = chars as i32 * SMALL_GLYPH_PX;
        for _ in 0..total {
            m.step(chars);
        }
        assert_eq!(m.offset_px(), -total);
        m.step(chars);
        assert_eq!(m.offset_px(), 0);
        m.step(chars);
        assert_eq!(m.offset_px(), -1);
    }

    #[test]
    fn panel_resets_scroll_on_new_text() {
        let mut panel = TextPanel::new();
        panel.set_line(StatusLine::Two, "a very long status message", Some(Rgb(0xFF0000)));
        panel.animate();
        panel.animate();
        assert_eq!(panel.line(StatusLine::Two).marquee.offset_px(), -2);

        panel.set_line(StatusLine::Two, "short", None);
        let line = panel.line(StatusLine::Two);
        assert_eq!(line.marquee.offset_px(), 0);
        assert_eq!(line.color, Rgb(0xFF0000));
        assert_eq!(line.text, "short");
    }

    struct Led(std::rc::Rc<std::cell::Cell<Rgb>>);

    impl Indicator for Led {
        fn show(&mut self, color: Rgb) {
            self.0.set(color);
        }
    }

    #[test]
    fn indicator_follows_panel() {
        let seen = std::rc::Rc::new(std::cell::Cell::new(Rgb::BLACK));
        let mut panel = TextPanel::new().with_indicator(Box::new(Led(seen.clone())));
        panel.set_indicator_color(Rgb(0x330000));
        assert_eq!(seen.get(), Rgb(0x330000));
        assert_eq!(panel.indicator_color(), Rgb(0x330000));
    }

    #[test]
    fn line_numbers_are_one_based() {
        assert_eq!(StatusLine::One.number(), 1);
        assert_eq!(StatusLine::Two.number(), 2);
    }
}
