use chrono::{
    format::{Item, StrftimeItems},
    DateTime, Local, TimeZone,
};

/// Moment-style tokens and their strftime equivalents, longest first so that
/// `YYYY` wins over `YY`.
const TOKENS: &[(&str, &str)] = &[
    ("YYYY", "%Y"),
    ("YY", "%y"),
    ("MMMM", "%B"),
    ("MMM", "%b"),
    ("MM", "%m"),
    ("M", "%-m"),
    ("DDDD", "%j"),
    ("DD", "%d"),
    ("D", "%-d"),
    ("dddd", "%A"),
    ("ddd", "%a"),
    ("HH", "%H"),
    ("H", "%-H"),
    ("hh", "%I"),
    ("h", "%-I"),
    ("mm", "%M"),
    ("m", "%-M"),
    ("SSS", "%3f"),
    ("ss", "%S"),
    ("s", "%-S"),
    ("ZZ", "%z"),
    ("Z", "%:z"),
    ("A", "%p"),
    ("a", "%P"),
    ("X", "%s"),
];

/// A validated timestamp format for log lines.
///
/// Built from a moment-style pattern (`YYYY-MM-DD HH:mm:ss Z`), the syntax
/// used by `log_date_format`. Text inside `[...]` is copied literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFormat {
    strftime: String,
}

impl DateFormat {
    pub fn from_pattern(pattern: &str) -> Result<Self, String> {
        let strftime = translate(pattern)?;
        if StrftimeItems::new(&strftime).any(|item| matches!(item, Item::Error)) {
            return Err(format!("`{pattern}` is not a supported date format"));
        }
        Ok(Self { strftime })
    }

    /// The equivalent chrono/strftime format string.
    pub fn as_strftime(&self) -> &str {
        &self.strftime
    }

    pub fn format<Tz>(&self, at: &DateTime<Tz>) -> String
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        at.format(&self.strftime).to_string()
    }

    pub fn now(&self) -> String {
        self.format(&Local::now())
    }
}

impl Default for DateFormat {
    fn default() -> Self {
        Self {
            strftime: "%Y-%m-%dT%H:%M:%S".to_string(),
        }
    }
}

fn translate(pattern: &str) -> Result<String, String> {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'scan: while !rest.is_empty() {
        if let Some(escaped) = rest.strip_prefix('[') {
            let end = escaped
                .find(']')
                .ok_or_else(|| format!("unterminated `[` in `{pattern}`"))?;
            push_literal(&mut out, &escaped[..end]);
            rest = &escaped[end + 1..];
            continue;
        }
        for (token, item) in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                out.push_str(item);
                rest = after;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            push_literal(&mut out, c.encode_utf8(&mut [0; 4]));
        }
        rest = chars.as_str();
    }
    Ok(out)
}

fn push_literal(out: &mut String, text: &str) {
    out.push_str(&text.replace('%', "%%"));
}
