//! SMS segment accounting and deterministic splitting
//!
//! Routine messages go out as one concatenated SMS and are only counted
//! here ([`count`]). Each part produced by [`split`] is sent as its own
//! single-segment SMS, so a part including its `(i/n) ` marker never exceeds
//! 160 GSM-7 characters or 70 UCS-2 code units.

use once_cell::sync::Lazy;
use std::collections::HashSet;

pub const GSM7_SEGMENT_LIMIT: usize = 160;
pub const UCS2_SEGMENT_LIMIT: usize = 70;

/// Per-segment capacity once the concatenation header is added
pub const GSM7_MULTIPART_LIMIT: usize = 153;
pub const UCS2_MULTIPART_LIMIT: usize = 67;

const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// Characters sent as an escape plus a second septet
const GSM7_EXTENDED: &str = "^{}\\[~]|€\u{000C}";

static BASIC: Lazy<HashSet<char>> = Lazy::new(|| GSM7_BASIC.chars().collect());
static EXTENDED: Lazy<HashSet<char>> = Lazy::new(|| GSM7_EXTENDED.chars().collect());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gsm7,
    Ucs2,
}

impl Encoding {
    pub fn detect(text: &str) -> Self {
        if text
            .chars()
            .all(|c| BASIC.contains(&c) || EXTENDED.contains(&c))
        {
            Encoding::Gsm7
        } else {
            Encoding::Ucs2
        }
    }

    pub fn segment_limit(&self) -> usize {
        match self {
            Encoding::Gsm7 => GSM7_SEGMENT_LIMIT,
            Encoding::Ucs2 => UCS2_SEGMENT_LIMIT,
        }
    }

    fn multipart_limit(&self) -> usize {
        match self {
            Encoding::Gsm7 => GSM7_MULTIPART_LIMIT,
            Encoding::Ucs2 => UCS2_MULTIPART_LIMIT,
        }
    }

    fn units(&self, c: char) -> usize {
        match self {
            Encoding::Gsm7 if EXTENDED.contains(&c) => 2,
            Encoding::Gsm7 => 1,
            Encoding::Ucs2 => c.len_utf16(),
        }
    }

    /// Length of `text` in this encoding's units
    pub fn length(&self, text: &str) -> usize {
        text.chars().map(|c| self.units(c)).sum()
    }
}

/// Whether `text` fits in one segment
pub fn fits_single(text: &str) -> bool {
    let encoding = Encoding::detect(text);
    encoding.length(text) <= encoding.segment_limit()
}

/// Carrier segments needed to deliver `text` as one concatenated SMS
pub fn count(text: &str) -> usize {
    let encoding = Encoding::detect(text);
    let length = encoding.length(text);
    if length <= encoding.segment_limit() {
        1
    } else {
        length.div_ceil(encoding.multipart_limit())
    }
}

/// Split `text` into standalone parts prefixed `(i/n) `, breaking at
/// whitespace where possible. Text that fits one segment is returned as is.
pub fn split(text: &str) -> Vec<String> {
    let text = text.trim();
    let encoding = Encoding::detect(text);
    let limit = encoding.segment_limit();

    if encoding.length(text) <= limit {
        return vec![text.to_string()];
    }

    // The marker is widest when both numbers have the most digits
    let mut chunks = Vec::new();
    for width in 1..=4u32 {
        let marker_len = 2 * width as usize + 4;
        chunks = wrap(text, limit - marker_len, encoding);
        if chunks.len() < 10usize.pow(width) {
            break;
        }
    }

    let total = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("({}/{}) {}", i + 1, total, chunk))
        .collect()
}

fn wrap(text: &str, max_units: usize, encoding: Encoding) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }

        let mut end = start;
        let mut units = 0;
        let mut last_space = None;
        while end < chars.len() {
            let width = encoding.units(chars[end]);
            if units + width > max_units {
                break;
            }
            if chars[end].is_whitespace() {
                last_space = Some(end);
            }
            units += width;
            end += 1;
        }

        if end < chars.len() && !chars[end].is_whitespace() {
            if let Some(space) = last_space.filter(|&s| s > start) {
                end = space;
            }
        }
        if end == start {
            end = start + 1;
        }

        let part: String = chars[start..end].iter().collect();
        parts.push(part.trim_end().to_string());
        start = end;
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_detection() {
        assert_eq!(Encoding::detect("Your appointment is confirmed"), Encoding::Gsm7);
        assert_eq!(Encoding::detect("Señor Müller, café"), Encoding::Gsm7);
        // á is outside the GSM-7 alphabet
        assert_eq!(Encoding::detect("Confirmación para mañana"), Encoding::Ucs2);
        assert_eq!(Encoding::detect("Emergency 🔥"), Encoding::Ucs2);
    }

    #[test]
    fn test_extended_characters_count_double() {
        assert_eq!(Encoding::Gsm7.length("€10 [promo]"), 14);
        assert_eq!(Encoding::Ucs2.length("🔥a"), 3);
    }

    #[test]
    fn test_concatenated_segment_count() {
        assert_eq!(count("Reminder: technician arrives at 9am."), 1);
        assert_eq!(count(&"a".repeat(160)), 1);
        assert_eq!(count(&"a".repeat(161)), 2);
        assert_eq!(count(&"a".repeat(306)), 2);
        assert_eq!(count(&"a".repeat(307)), 3);
        // One accented letter moves the whole text to 67-unit segments
        let spanish = format!("Su cita está confirmada. {}", "a".repeat(60));
        assert_eq!(Encoding::detect(&spanish), Encoding::Ucs2);
        assert_eq!(count(&spanish), 2);
    }

    #[test]
    fn test_short_message_is_not_split() {
        let parts = split("  Reminder: technician arrives at 9am.  ");
        assert_eq!(parts, vec!["Reminder: technician arrives at 9am.".to_string()]);
    }

    #[test]
    fn test_long_gsm_message_splits_at_whitespace() {
        let text = "word ".repeat(60);
        let parts = split(&text);
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("(1/2) "));
        assert!(parts[1].starts_with("(2/2) "));
        for part in &parts {
            assert!(Encoding::Gsm7.length(part) <= GSM7_SEGMENT_LIMIT);
            assert!(part.ends_with("word"));
        }
    }

    #[test]
    fn test_ucs2_parts_respect_smaller_limit() {
        let text = "Alerta de emergencia: fuga de gas en la dirección indicada, acuda inmediatamente por favor. Llame al cliente.";
        let parts = split(text);
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(Encoding::Ucs2.length(part) <= UCS2_SEGMENT_LIMIT);
        }
        let rejoined: Vec<&str> = parts
            .iter()
            .map(|p| p.splitn(2, ") ").nth(1).unwrap_or(""))
            .collect();
        assert_eq!(rejoined.join(" "), text);
    }

    #[test]
    fn test_unbroken_text_is_hard_split() {
        let text = "x".repeat(400);
        let parts = split(&text);
        assert_eq!(parts.len(), 3);
        let total: usize = parts
            .iter()
            .map(|p| p.splitn(2, ") ").nth(1).unwrap_or("").len())
            .sum();
        assert_eq!(total, 400);
    }

    #[test]
    fn test_split_is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(10);
        assert_eq!(split(&text), split(&text));
        assert!(!fits_single(&text));
    }
}
