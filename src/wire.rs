//! Textual event framing for serve/connect modes: one event per line,
//! `type:value:code:sec:usec`. This format is stable.

use evdev::EventType;

use crate::resolver::RawEvent;
use crate::time_util::EventTime;

/// Serialize one event, including the trailing newline.
#[must_use]
pub fn format_event(ev: RawEvent) -> String {
    format!(
        "{}:{}:{}:{}:{}\n",
        ev.kind.0, ev.value, ev.code, ev.time.sec, ev.time.usec
    )
}

/// Parse one line. Malformed lines yield `None` and are ignored by
/// callers; a trailing newline is accepted.
#[must_use]
pub fn parse_event(line: &str) -> Option<RawEvent> {
    let mut fields = line.trim_end_matches(['\n', '\r']).split(':');
    let kind = fields.next()?.parse::<u16>().ok()?;
    let value = fields.next()?.parse::<i32>().ok()?;
    let code = fields.next()?.parse::<u16>().ok()?;
    let sec = fields.next()?.parse::<i64>().ok()?;
    let usec = fields.next()?.parse::<i64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(RawEvent::new(
        EventType(kind),
        code,
        value,
        EventTime::new(sec, usec),
    ))
}
