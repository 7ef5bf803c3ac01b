use core::fmt;

/// 24-bit RGB color, `0xRRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rgb(pub u32);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0x000000);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb(((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub const fn is_off(self) -> bool {
        self.0 & 0xFF_FFFF == 0
    }

    /// Parse exactly six hex digits (either case).
    pub fn from_hex6(digits: &str) -> Option<Self> {
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u32::from_str_radix(digits, 16).ok().map(Rgb)
    }

    /// Parse a configured color: `#RRGGBB`, `RRGGBB`, `0xRRGGBB` or `r,g,b`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.contains(',') {
            let mut parts = s.split(',').map(|p| p.trim().parse::<u8>());
            let (r, g, b) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
            if parts.next().is_some() {
                return None;
            }
            return Some(Rgb::new(r, g, b));
        }
        let digits = s
            .strip_prefix('#')
            .or_else(|| s.strip_prefix("0x"))
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        Rgb::from_hex6(digits)
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0 & 0xFF_FFFF)
    }
}

// ── Status vocabulary ───────────────────────────────────────────────

pub const SUCCESS: Rgb = Rgb(0x00FF00);
pub const INFO: Rgb = Rgb(0x00FFFF);
pub const WARNING: Rgb = Rgb(0xFFFF00);
pub const ERROR: Rgb = Rgb(0xFF0000);

/// Color of bus-driven status lines that carry no color tag.
pub const MESSAGE_DEFAULT: Rgb = Rgb(0x666666);

// ── Clock face banding ──────────────────────────────────────────────

pub const CLOCK_DAY: Rgb = Rgb(0x00FF00);
pub const CLOCK_DIM: Rgb = Rgb(0xCC4000);
pub const CLOCK_NIGHT: Rgb = Rgb(0xFF0000);

/// Split a leading `#RRGGBB#` tag off a status-line payload.
///
/// Anything that is not exactly `#`, six hex digits, `#` leaves the payload
/// untouched.
pub fn split_color_tag(payload: &str) -> (Option<Rgb>, &str) {
    let bytes = payload.as_bytes();
    if bytes.len() < 8 || bytes[0] != b'#' || bytes[7] != b'#' {
        return (None, payload);
    }
    // Bytes 0 and 7 are ASCII, so 1..7 and 8.. sit on char boundaries.
    match Rgb::from_hex6(&payload[1..7]) {
        Some(color) => (Some(color), &payload[8..]),
        None => (None, payload),
    }
}

/// Text and color for a status line received from the bus.
pub fn line_from_payload(payload: &str) -> (&str, Rgb) {
    let (tag, text) = split_color_tag(payload);
    let text = if text.is_empty() { " " } else { text };
    (text, tag.unwrap_or(MESSAGE_DEFAULT))
}
