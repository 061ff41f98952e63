//! Config-to-resolver round trips through the public API: parse a TOML
//! config, pick a device by name, and drive the attached keymap.

use std::sync::{Arc, Mutex};

use evdev::EventType;

use tapmux::config::Config;
use tapmux::grab::GrabVerdict;
use tapmux::resolver::{EventSink, RawEvent, Resolver};
use tapmux::time_util::{Clock, EventTime};

const CONFIG: &str = r#"
    hold_ms = 200

    [[device]]
    pattern = "tapmux virtual"
    ignore = true

    [[device]]
    pattern = "ergodox|keyboard"
    keymap = "main"

    [keymaps.main]
    capslock = "esc"
    space = { tap = "space", hold = { layer = "nav" }, mode = "timeout_only" }

    [keymaps.nav]
    h = "left"
    l = "right"
"#;

const ESC: u16 = 1;
const H: u16 = 35;
const L: u16 = 38;
const CAPS: u16 = 58;
const SPACE: u16 = 57;
const LEFT: u16 = 105;
const RIGHT: u16 = 106;

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<RawEvent>>>);

impl Recorder {
    fn keys(&self) -> Vec<(u16, i32)> {
        std::mem::take(&mut *self.0.lock().unwrap())
            .into_iter()
            .filter(|ev| ev.kind == EventType::KEY)
            .map(|ev| (ev.code, ev.value))
            .collect()
    }
}

impl EventSink for Recorder {
    fn send(&mut self, ev: RawEvent) {
        self.0.lock().unwrap().push(ev);
    }
}

#[derive(Clone)]
struct FixedClock(Arc<Mutex<EventTime>>);

impl Clock for FixedClock {
    fn now(&self) -> EventTime {
        *self.0.lock().unwrap()
    }
}

fn at(ms: i64) -> EventTime {
    EventTime::new(ms / 1000, (ms % 1000) * 1000)
}

#[test]
fn device_rules_route_by_name() {
    let config = Config::parse(CONFIG).unwrap();
    assert_eq!(
        config.grabs.verdict("tapmux virtual keyboard"),
        GrabVerdict::Ignore(0)
    );
    assert_eq!(config.grabs.verdict("ErgoDox EZ"), GrabVerdict::Grab(1));
    assert_eq!(config.grabs.verdict("USB KEYBOARD"), GrabVerdict::Grab(1));
    assert_eq!(config.grabs.verdict("Some Mouse"), GrabVerdict::NoMatch);
}

#[test]
fn configured_keymap_drives_a_resolver() {
    let config = Config::parse(CONFIG).unwrap();
    let rule = config.grabs.match_device("ErgoDox EZ").unwrap();
    let tree = config.grabs.tree(rule).unwrap();

    let out = Recorder::default();
    let time = Arc::new(Mutex::new(EventTime::default()));
    let mut resolver = Resolver::with_clock(
        tree,
        Box::new(out.clone()),
        Box::new(FixedClock(Arc::clone(&time))),
    );

    let mut feed = |resolver: &mut Resolver, code: u16, value: i32, ms: i64| {
        *time.lock().unwrap() = at(ms);
        resolver.push_event(RawEvent::key(code, value, at(ms)));
    };

    // capslock is remapped, other keys pass through
    feed(&mut resolver, CAPS, 1, 0);
    feed(&mut resolver, CAPS, 0, 20);
    feed(&mut resolver, H, 1, 30);
    feed(&mut resolver, H, 0, 40);
    assert_eq!(out.keys(), vec![(ESC, 1), (ESC, 0), (H, 1), (H, 0)]);

    // a quick space tap stays a space
    feed(&mut resolver, SPACE, 1, 100);
    feed(&mut resolver, SPACE, 0, 150);
    assert_eq!(out.keys(), vec![(SPACE, 1), (SPACE, 0)]);

    // space held past the timeout becomes the nav layer
    feed(&mut resolver, SPACE, 1, 200);
    *time.lock().unwrap() = at(401);
    resolver.tick();
    feed(&mut resolver, H, 1, 410);
    feed(&mut resolver, H, 0, 420);
    feed(&mut resolver, L, 1, 430);
    feed(&mut resolver, L, 0, 440);
    feed(&mut resolver, SPACE, 0, 450);
    assert_eq!(
        out.keys(),
        vec![(LEFT, 1), (LEFT, 0), (RIGHT, 1), (RIGHT, 0)]
    );

    // and the root layer is back afterwards
    feed(&mut resolver, H, 1, 500);
    feed(&mut resolver, H, 0, 510);
    assert_eq!(out.keys(), vec![(H, 1), (H, 0)]);
}
