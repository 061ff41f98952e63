//! The per-keyboard resolver: decides how each raw key event is translated,
//! buffering events whose meaning depends on the future (dual-role keys)
//! and emitting everything else in arrival order.

use std::sync::Arc;

use evdev::EventType;
use tracing::{debug, warn};

use crate::key_action::{DualKey, DualMode, KeyAction, KeymapTree, LayerId, KEY_COUNT, KEY_MAX};
use crate::time_util::{Clock, EventTime, SystemClock};

/// Capacity of the unresolved-event ring. Events arriving while the ring is
/// full are dropped with a warning rather than blocking the device loop.
pub const URMAX: usize = 1024;

/// Sentinel stored in the release map for keys that entered a layer: their
/// release restores the root layer instead of emitting an event.
pub const RESET_KEYMAP: u16 = KEY_MAX + 1;

/// One kernel input event in the form the resolver works with. Mirrors the
/// evdev `input_event` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventType,
    pub code: u16,
    pub value: i32,
    pub time: EventTime,
}

impl RawEvent {
    #[must_use]
    pub const fn new(kind: EventType, code: u16, value: i32, time: EventTime) -> Self {
        Self { kind, code, value, time }
    }

    #[must_use]
    pub const fn key(code: u16, value: i32, time: EventTime) -> Self {
        Self::new(EventType::KEY, code, value, time)
    }

    /// A SYN_REPORT marking the end of a packet.
    #[must_use]
    pub const fn syn(time: EventTime) -> Self {
        Self::new(EventType::SYNCHRONIZATION, 0, 0, time)
    }
}

/// Receives translated events. Implementations never call back into the
/// resolver; they may drop on backpressure and must handle their own
/// errors, because the resolver does not depend on delivery.
pub trait EventSink: Send {
    fn send(&mut self, ev: RawEvent);
}

/// Fixed-size ring of events awaiting a decision. No event can resolve
/// until every event before it has.
struct EventRing {
    buf: Box<[RawEvent]>,
    start: usize,
    len: usize,
}

impl EventRing {
    fn new() -> Self {
        Self {
            buf: vec![RawEvent::syn(EventTime::default()); URMAX].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    const fn len(&self) -> usize {
        self.len
    }

    const fn is_full(&self) -> bool {
        self.len == URMAX
    }

    fn push_back(&mut self, ev: RawEvent) {
        debug_assert!(!self.is_full());
        self.buf[(self.start + self.len) % URMAX] = ev;
        self.len += 1;
    }

    fn front(&self) -> Option<RawEvent> {
        (self.len > 0).then(|| self.buf[self.start])
    }

    fn back(&self) -> Option<RawEvent> {
        (self.len > 0).then(|| self.buf[(self.start + self.len - 1) % URMAX])
    }

    fn pop_front(&mut self) {
        debug_assert!(self.len > 0);
        self.start = (self.start + 1) % URMAX;
        self.len -= 1;
    }

    fn pop_back(&mut self) {
        debug_assert!(self.len > 0);
        self.len -= 1;
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    /// Iterate by position from the oldest event.
    fn iter(&self) -> impl Iterator<Item = &RawEvent> {
        (0..self.len).map(|i| &self.buf[(self.start + i) % URMAX])
    }
}

/// Outcome of classifying a pending dual-role press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waveform {
    Tap,
    Hold,
    NoneYet,
}

/// Per-device translation state machine.
///
/// The supervisor feeds events in with [`push_event`](Self::push_event) (or
/// [`dedup_push`](Self::dedup_push) when several physical devices share one
/// resolver), calls [`tick`](Self::tick) once
/// [`next_deadline`](Self::next_deadline) elapses, and otherwise leaves the
/// resolver alone. All work completes synchronously; the resolver never
/// sleeps.
pub struct Resolver {
    sink: Box<dyn EventSink>,
    tree: Arc<KeymapTree>,
    clock: Box<dyn Clock>,
    unresolved: EventRing,
    /// For each pressed input code, the output code its release must emit,
    /// 0 when not pressed, or RESET_KEYMAP for layer keys.
    release_map: Box<[u16]>,
    /// Logical-OR counters for the multi-device dedup front end.
    input_counts: Box<[i32]>,
    /// Set when dedup swallowed a key event, so the SYN that trails it is
    /// swallowed too.
    suppressed_key: bool,
    root: LayerId,
    current: LayerId,
    /// Earliest time the oldest unresolved event becomes resolvable by
    /// timeout.
    resolvable_at: Option<EventTime>,
    /// Most recent tap of a dual key, for double-tap repeat detection.
    last_tap: Option<(u16, EventTime)>,
}

impl Resolver {
    #[must_use]
    pub fn new(tree: Arc<KeymapTree>, sink: Box<dyn EventSink>) -> Self {
        Self::with_clock(tree, sink, Box::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        tree: Arc<KeymapTree>,
        sink: Box<dyn EventSink>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let root = tree.root();
        Self {
            sink,
            tree,
            clock,
            unresolved: EventRing::new(),
            release_map: vec![0; KEY_COUNT].into_boxed_slice(),
            input_counts: vec![0; KEY_COUNT].into_boxed_slice(),
            suppressed_key: false,
            root,
            current: root,
            resolvable_at: None,
            last_tap: None,
        }
    }

    /// Queue one event and resolve as far as possible. A full queue drops
    /// the event with a warning; the device loop must never block here.
    pub fn push_event(&mut self, ev: RawEvent) {
        if self.unresolved.is_full() {
            warn!(code = ev.code, "unresolved event queue full, dropping event");
            return;
        }
        self.unresolved.push_back(ev);
        self.drain();
    }

    /// Multi-device front end: logically ORs press/release streams from
    /// several sources so the downstream sees one balanced pair per code.
    pub fn dedup_push(&mut self, ev: RawEvent) {
        if ev.kind == EventType::KEY && ev.code <= KEY_MAX {
            let idx = usize::from(ev.code);
            match ev.value {
                1 => {
                    self.input_counts[idx] += 1;
                    if self.input_counts[idx] != 1 {
                        self.suppressed_key = true;
                        return;
                    }
                }
                0 => {
                    if self.input_counts[idx] == 0 {
                        debug!(code = ev.code, "stray release with no tracked press");
                        self.suppressed_key = true;
                        return;
                    }
                    self.input_counts[idx] -= 1;
                    if self.input_counts[idx] != 0 {
                        self.suppressed_key = true;
                        return;
                    }
                }
                _ => {}
            }
        } else if ev.kind == EventType::SYNCHRONIZATION && self.suppressed_key {
            // drop the SYN that trailed a suppressed key event
            self.suppressed_key = false;
            return;
        }
        self.suppressed_key = false;
        self.push_event(ev);
    }

    /// Called by the supervisor once [`next_deadline`](Self::next_deadline)
    /// has elapsed; calling earlier is harmless.
    pub fn tick(&mut self) {
        self.drain();
    }

    /// Absolute time by which [`tick`](Self::tick) should run, if a pending
    /// dual-role press is waiting on its hold timeout.
    #[must_use]
    pub fn next_deadline(&self) -> Option<EventTime> {
        self.resolvable_at
    }

    /// Number of events still awaiting a decision.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.unresolved.len()
    }

    /// Discard undecided events and release every key currently held
    /// through this resolver, stamped `now`. Used when the backing device
    /// disappears or the daemon shuts down, so downstream never sees a
    /// stuck key.
    pub fn release_held(&mut self, now: EventTime) {
        let pending = self.unresolved.len();
        if pending > 0 {
            debug!(pending, "discarding undecided events");
        }
        self.unresolved.clear();
        self.resolvable_at = None;
        self.last_tap = None;
        self.suppressed_key = false;
        self.input_counts.fill(0);

        let mut released = false;
        for code in 0..=KEY_MAX {
            if self.release_map[usize::from(code)] != 0 {
                self.push_event(RawEvent::key(code, 0, now));
                released = true;
            }
        }
        if released {
            self.push_event(RawEvent::syn(now));
        }
    }

    /// Resolve the oldest event for as long as progress is possible.
    fn drain(&mut self) {
        while self.resolve_oldest() {}
    }

    /// Try to resolve the oldest unresolved event. Returns false when the
    /// queue is empty or the oldest event has to wait, after attempting an
    /// early release of the newest event.
    fn resolve_oldest(&mut self) -> bool {
        let Some(ev) = self.unresolved.front() else {
            return false;
        };
        self.resolvable_at = None;

        let resolved = if ev.kind == EventType::KEY {
            if ev.code > KEY_MAX {
                debug!(code = ev.code, "dropping out-of-range key code");
                true
            } else {
                match ev.value {
                    0 => {
                        self.resolve_release(ev);
                        true
                    }
                    1 => self.resolve_press(ev),
                    2 => {
                        self.resolve_repeat(ev);
                        true
                    }
                    value => {
                        warn!(code = ev.code, value, "dropping key event with invalid value");
                        true
                    }
                }
            }
        } else {
            // SYN, REL, MSC and friends pass through untouched
            self.sink.send(ev);
            true
        };

        if resolved {
            self.unresolved.pop_front();
        } else {
            self.try_early_release();
        }
        resolved
    }

    fn resolve_release(&mut self, ev: RawEvent) {
        let idx = usize::from(ev.code);
        match self.release_map[idx] {
            RESET_KEYMAP => self.current = self.root,
            // already released early, or the press never produced output
            0 => {}
            out => self.sink.send(RawEvent::key(out, 0, ev.time)),
        }
        self.release_map[idx] = 0;
    }

    fn resolve_repeat(&mut self, ev: RawEvent) {
        match self.release_map[usize::from(ev.code)] {
            0 | RESET_KEYMAP => {}
            out => self.sink.send(RawEvent::key(out, 2, ev.time)),
        }
    }

    fn resolve_press(&mut self, ev: RawEvent) -> bool {
        // pressing anything else ends a double-tap window
        if self.last_tap.is_some_and(|(code, _)| code != ev.code) {
            self.last_tap = None;
        }

        let action = self.tree.lookup(self.current, ev.code).clone();
        match action {
            KeyAction::Dual(dual) => match self.classify(ev, &dual) {
                Waveform::Tap => {
                    self.dispatch_press(ev, &dual.tap);
                    true
                }
                Waveform::Hold => {
                    self.dispatch_press(ev, &dual.hold);
                    true
                }
                Waveform::NoneYet => {
                    // wait for the hold timeout to decide
                    self.resolvable_at = Some(ev.time.msec_after(dual.hold_ms));
                    false
                }
            },
            other => {
                self.dispatch_press(ev, &other);
                true
            }
        }
    }

    /// Apply a terminal (non-dual) action for a resolved press.
    fn dispatch_press(&mut self, ev: RawEvent, action: &KeyAction) {
        match action {
            KeyAction::Simple(out) => {
                self.release_map[usize::from(ev.code)] = *out;
                self.sink.send(RawEvent::key(*out, 1, ev.time));
            }
            KeyAction::Macro(steps) => {
                // the macro emits its own balanced sequence; the triggering
                // release stays silent (release_map untouched)
                for step in steps.iter() {
                    self.sink
                        .send(RawEvent::key(step.code, i32::from(step.press), ev.time));
                    self.sink.send(RawEvent::syn(ev.time));
                }
            }
            KeyAction::Map(layer) => {
                self.current = *layer;
                self.release_map[usize::from(ev.code)] = RESET_KEYMAP;
            }
            KeyAction::None | KeyAction::Ref(..) | KeyAction::Dual(_) => {
                unreachable!("lookup and build validation yield terminal actions only")
            }
        }
    }

    /// Decide tap or hold for the pending dual press `ev`, or report that
    /// neither is knowable yet.
    fn classify(&mut self, ev: RawEvent, dual: &DualKey) -> Waveform {
        let now = self.clock.now();

        // old enough that we know the key is being held
        if now.msec_since(ev.time) > dual.hold_ms {
            let double_tap = dual.double_tap_ms >= 0
                && self.last_tap.is_some_and(|(code, at)| {
                    code == ev.code
                        && (dual.double_tap_ms == 0
                            || ev.time.msec_since(at) < dual.double_tap_ms)
                });
            self.last_tap = None;
            return if double_tap { Waveform::Tap } else { Waveform::Hold };
        }

        let mut pressed = [false; KEY_COUNT];
        for ev2 in self.unresolved.iter().skip(1) {
            if ev2.kind != EventType::KEY {
                continue;
            }
            // the key came back up on its own: a tap, and the next
            // double-tap candidate
            if ev2.value == 0 && ev2.code == ev.code {
                self.last_tap = Some((ev2.code, ev2.time));
                return Waveform::Tap;
            }
            // only the timeout may force hold in this mode
            if dual.mode == DualMode::TimeoutOnly {
                continue;
            }
            if dual.mode == DualMode::HoldOnRollover && ev2.value == 1 {
                self.last_tap = None;
                return Waveform::Hold;
            }
            if ev2.value == 1 && ev2.code <= KEY_MAX {
                pressed[usize::from(ev2.code)] = true;
                self.last_tap = None;
            } else if ev2.value == 0
                && ev2.code <= KEY_MAX
                && pressed[usize::from(ev2.code)]
            {
                // roll-off: another key went down and up while this one was
                // still held
                self.last_tap = None;
                return Waveform::Hold;
            }
        }
        Waveform::NoneYet
    }

    /// The oldest event is stuck on a pending dual. If the newest queued
    /// event is the release of a key whose press already resolved, emit it
    /// ahead of the pending press so typing stays responsive. Safe because
    /// that press resolved strictly before the dual went undecided.
    fn try_early_release(&mut self) {
        let Some(newest) = self.unresolved.back() else {
            return;
        };
        if newest.kind != EventType::KEY || newest.value != 0 || newest.code > KEY_MAX {
            return;
        }
        let idx = usize::from(newest.code);
        match self.release_map[idx] {
            RESET_KEYMAP => {
                // layer keys restore the root directly, nothing is emitted
                self.current = self.root;
                self.release_map[idx] = 0;
                self.unresolved.pop_back();
            }
            // press not resolved yet (still queued behind the dual) or
            // never tracked: leave the release in order
            0 => {}
            // bare modifiers must stay in order or chords break
            out if is_bare_modifier(out) => {}
            out => {
                self.sink.send(RawEvent::key(out, 0, newest.time));
                self.sink.send(RawEvent::syn(newest.time));
                self.release_map[idx] = 0;
                self.unresolved.pop_back();
            }
        }
    }
}

const BARE_MODIFIERS: [u16; 8] = [
    evdev::Key::KEY_LEFTALT.0,
    evdev::Key::KEY_RIGHTALT.0,
    evdev::Key::KEY_LEFTCTRL.0,
    evdev::Key::KEY_RIGHTCTRL.0,
    evdev::Key::KEY_LEFTMETA.0,
    evdev::Key::KEY_RIGHTMETA.0,
    evdev::Key::KEY_LEFTSHIFT.0,
    evdev::Key::KEY_RIGHTSHIFT.0,
];

fn is_bare_modifier(code: u16) -> bool {
    BARE_MODIFIERS.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_iterates_in_arrival_order_across_wrap() {
        let mut ring = EventRing::new();
        // force the start index away from zero
        for i in 0..10 {
            ring.push_back(RawEvent::key(i, 1, EventTime::default()));
        }
        for _ in 0..10 {
            ring.pop_front();
        }
        for i in 0..URMAX as u16 {
            ring.push_back(RawEvent::key(i, 1, EventTime::default()));
        }
        assert!(ring.is_full());
        let codes: Vec<u16> = ring.iter().map(|ev| ev.code).collect();
        assert_eq!(codes.first(), Some(&0));
        assert_eq!(codes.last(), Some(&(URMAX as u16 - 1)));
        assert_eq!(ring.front().map(|ev| ev.code), Some(0));
        assert_eq!(ring.back().map(|ev| ev.code), Some(URMAX as u16 - 1));
    }

    #[test]
    fn ring_pop_back_removes_newest() {
        let mut ring = EventRing::new();
        ring.push_back(RawEvent::key(1, 1, EventTime::default()));
        ring.push_back(RawEvent::key(2, 0, EventTime::default()));
        ring.pop_back();
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.back().map(|ev| ev.code), Some(1));
    }

    #[test]
    fn bare_modifier_set_matches_kernel_codes() {
        assert!(is_bare_modifier(29)); // leftctrl
        assert!(is_bare_modifier(42)); // leftshift
        assert!(is_bare_modifier(126)); // rightmeta
        assert!(!is_bare_modifier(30)); // a
        assert!(!is_bare_modifier(58)); // capslock
    }
}
