//! # Unsolicited Result Code Table
//!
//! A declarative list of `(pattern, kind)` rules evaluated by one matcher.
//! The AT port consults it to tell unsolicited lines apart from response
//! lines (even while a command is outstanding); the correlator matches
//! interests on the resulting [`UrcKind`].
//!
//! Rules are evaluated in order and the first match wins. Patterns are
//! written so that solicited query responses with the same prefix (e.g. the
//! `+CREG: <n>,<stat>` answer to `AT+CREG?`) do not match.

use regex::Regex;

/// What an unsolicited line is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrcKind {
    /// `+CREG` / `+CGREG` / `+CEREG` / `+C5GREG` registration changes.
    Registration,
    /// Access technology change (`^MODE`).
    AccessTechnology,
    /// Signal quality report (`^RSSI`).
    SignalQuality,
    /// Data bearer connection state (`^NDISSTAT`).
    BearerState,
    /// Packet domain event (`+CGEV`).
    PacketDomain,
    /// Location engine session ended (`^POSEND`).
    LocationStopped,
    /// Incoming call.
    Ring,
    /// Vendor-specific rule added at runtime.
    Custom(&'static str),
}

/// A matched unsolicited line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urc {
    pub kind: UrcKind,
    /// Capture groups in order; unmatched optional groups are empty.
    pub fields: Vec<String>,
    pub raw: String,
}

impl Urc {
    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields
            .get(idx)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn field_u32(&self, idx: usize) -> Option<u32> {
        self.field(idx).and_then(|s| s.trim().parse().ok())
    }
}

struct UrcRule {
    pattern: Regex,
    kind: UrcKind,
}

/// Ordered rule table. Immutable once built; shared read-only.
pub struct UrcTable {
    rules: Vec<UrcRule>,
}

/// Rules every AT port understands.
const STANDARD_RULES: &[(&str, UrcKind)] = &[
    (
        r#"^\+C(?:5G|E|G)?REG:\s*(\d+)(?:\s*,\s*"([0-9A-Fa-f]+)"\s*,\s*"([0-9A-Fa-f]+)"(?:\s*,\s*(\d+))?)?\s*$"#,
        UrcKind::Registration,
    ),
    (r"^\^MODE:\s*(\d+)(?:\s*,\s*(\d+))?\s*$", UrcKind::AccessTechnology),
    (r"^\^RSSI:\s*(\d+)\s*$", UrcKind::SignalQuality),
    (r"^\^NDISSTAT:\s*(\d)\s*(?:,(.*))?$", UrcKind::BearerState),
    (r"^\+CGEV:\s*(.+)$", UrcKind::PacketDomain),
    (r"^\^POSEND:\s*(\d+)(?:\s*,\s*(\d+))?\s*$", UrcKind::LocationStopped),
    (r"^(?:RING|\+CRING:.*)$", UrcKind::Ring),
];

impl UrcTable {
    /// An empty table: every line is a response line.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// The standard 3GPP and common vendor rules.
    pub fn standard() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .map(|(pattern, kind)| UrcRule {
                // Patterns are compile-time constants covered by tests.
                pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad URC rule {pattern}: {e}")),
                kind: *kind,
            })
            .collect();
        Self { rules }
    }

    /// Append a rule evaluated after the existing ones.
    pub fn with_rule(mut self, pattern: &str, kind: UrcKind) -> Result<Self, regex::Error> {
        self.rules.push(UrcRule {
            pattern: Regex::new(pattern)?,
            kind,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Match a line against the rules; first match wins.
    pub fn match_line(&self, line: &str) -> Option<Urc> {
        let line = line.trim();
        self.rules.iter().find_map(|rule| {
            let caps = rule.pattern.captures(line)?;
            let fields = caps
                .iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().trim().to_string()).unwrap_or_default())
                .collect();
            Some(Urc {
                kind: rule.kind,
                fields,
                raw: line.to_string(),
            })
        })
    }
}

impl Default for UrcTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rules_compile() {
        assert_eq!(UrcTable::standard().len(), STANDARD_RULES.len());
    }

    #[test]
    fn registration_urc_matches_but_query_response_does_not() {
        let t = UrcTable::standard();

        let urc = t.match_line("+CREG: 1").unwrap();
        assert_eq!(urc.kind, UrcKind::Registration);
        assert_eq!(urc.field_u32(0), Some(1));

        let urc = t.match_line("+CEREG: 5,\"00AB\",\"01C2D3\",7").unwrap();
        assert_eq!(urc.field_u32(0), Some(5));
        assert_eq!(urc.field(1), Some("00AB"));
        assert_eq!(urc.field_u32(3), Some(7));

        // Solicited answers to AT+CREG? carry the <n> field first.
        assert!(t.match_line("+CREG: 0,1").is_none());
        assert!(t.match_line("+CREG: 2,1,\"00AB\",\"01C2\"").is_none());
    }

    #[test]
    fn vendor_lines() {
        let t = UrcTable::standard();
        assert_eq!(
            t.match_line("^NDISSTAT: 1,,,\"IPV4\"").map(|u| u.kind),
            Some(UrcKind::BearerState)
        );
        assert_eq!(
            t.match_line("^NDISSTAT: 0").and_then(|u| u.field_u32(0)),
            Some(0)
        );
        assert_eq!(
            t.match_line("^MODE: 5,4").map(|u| u.fields),
            Some(vec!["5".to_string(), "4".to_string()])
        );
        assert_eq!(
            t.match_line("+CGEV: NW DEACT \"IP\",\"10.0.0.2\",1")
                .map(|u| u.kind),
            Some(UrcKind::PacketDomain)
        );
        assert_eq!(
            t.match_line("^POSEND: 0").map(|u| u.kind),
            Some(UrcKind::LocationStopped)
        );
        // Query response uses a distinct tag.
        assert!(t.match_line("^NDISSTATQRY: 1,,,\"IPV4\"").is_none());
    }

    #[test]
    fn responses_are_not_unsolicited() {
        let t = UrcTable::standard();
        for line in ["OK", "ERROR", "+CGMM: \"E3372\"", "+CSQ: 20,99", "E3372"] {
            assert!(t.match_line(line).is_none(), "{line} matched");
        }
    }

    #[test]
    fn custom_rules_are_evaluated_last() {
        let t = UrcTable::standard()
            .with_rule(r"^\+QIND:\s*(.+)$", UrcKind::Custom("qind"))
            .unwrap();
        let urc = t.match_line("+QIND: SMS DONE").unwrap();
        assert_eq!(urc.kind, UrcKind::Custom("qind"));
        assert_eq!(urc.field(0), Some("SMS DONE"));
    }

    #[test]
    fn empty_table_matches_nothing() {
        assert!(UrcTable::empty().match_line("+CREG: 1").is_none());
    }
}
