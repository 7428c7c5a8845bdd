//! Presence for one room: display colors and cursor offsets.
//!
//! ## Color assignment
//!
//! ```text
//! join u1 ──► first unused palette slot   (#FF5733)
//! join u2 ──► next unused slot            (#33FF57)
//! leave u1 ─► slot #FF5733 is free again
//! join u3 ──► #FF5733
//! palette exhausted ──► hash(user_id) → hue → #rrggbb
//! ```
//!
//! The manager holds no lock of its own. It lives inside the room and is
//! mutated under the room's lock, so two joiners can never race for a slot.

use std::collections::BTreeMap;

/// Colors handed out in order while unused.
pub const DEFAULT_PALETTE: [&str; 10] = [
    "#FF5733", "#33FF57", "#3357FF", "#FF33A1", "#A133FF", "#33FFF6", "#FFD433", "#FF3333",
    "#33FF8A", "#8A33FF",
];

// ───────────────────────────────────────────────────────────────────
// Presence manager
// ───────────────────────────────────────────────────────────────────

/// Per-room presence state.
#[derive(Debug, Clone)]
pub struct PresenceManager {
    palette: Vec<String>,
    /// user → color
    colors: BTreeMap<String, String>,
    /// user → cursor offset (Unicode scalar values)
    cursors: BTreeMap<String, usize>,
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::with_palette(DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect())
    }

    pub fn with_palette(palette: Vec<String>) -> Self {
        Self {
            palette,
            colors: BTreeMap::new(),
            cursors: BTreeMap::new(),
        }
    }

    /// Give `user_id` a color, reusing the one it already holds.
    ///
    /// Picks the first palette entry no active user holds. When every slot
    /// is taken, derives a stable color from the user id instead.
    pub fn assign_color(&mut self, user_id: &str) -> String {
        if let Some(color) = self.colors.get(user_id) {
            return color.clone();
        }

        let color = self
            .palette
            .iter()
            .find(|slot| !self.colors.values().any(|used| used == *slot))
            .cloned()
            .unwrap_or_else(|| {
                log::debug!("Palette exhausted, deriving color for {user_id}");
                fallback_color(user_id)
            });

        self.colors.insert(user_id.to_string(), color.clone());
        color
    }

    /// Drop the user's color and cursor. Returns the released color.
    pub fn release(&mut self, user_id: &str) -> Option<String> {
        self.cursors.remove(user_id);
        self.colors.remove(user_id)
    }

    pub fn color_of(&self, user_id: &str) -> Option<&str> {
        self.colors.get(user_id).map(String::as_str)
    }

    pub fn colors(&self) -> &BTreeMap<String, String> {
        &self.colors
    }

    /// Last-write-wins cursor update. Returns the full cursor map.
    pub fn update_cursor(&mut self, user_id: &str, offset: usize) -> &BTreeMap<String, usize> {
        self.cursors.insert(user_id.to_string(), offset);
        &self.cursors
    }

    pub fn remove_cursor(&mut self, user_id: &str) -> Option<usize> {
        self.cursors.remove(user_id)
    }

    pub fn cursors(&self) -> &BTreeMap<String, usize> {
        &self.cursors
    }

    /// Palette slots currently held.
    pub fn palette_in_use(&self) -> usize {
        self.palette
            .iter()
            .filter(|slot| self.colors.values().any(|used| used == *slot))
            .count()
    }
}

// ───────────────────────────────────────────────────────────────────
// Fallback colors
// ───────────────────────────────────────────────────────────────────

/// Stable, vivid `#rrggbb` color derived from a user id.
pub fn fallback_color(user_id: &str) -> String {
    let hue = (fnv1a(user_id.as_bytes()) % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02X}{:02X}{:02X}",
        to_channel(r),
        to_channel(g),
        to_channel(b)
    )
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// HSL to RGB, all components in [0, 1].
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
