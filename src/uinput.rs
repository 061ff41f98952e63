//! The virtual output device: a uinput keyboard all translated events are
//! written to in local and connect modes.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key, MiscType, RelativeAxisType};
use smallvec::SmallVec;
use tracing::warn;

use crate::key_action::KEY_MAX;
use crate::resolver::{EventSink, RawEvent};

/// Name the virtual device announces; device scanning skips it so we never
/// grab our own output.
pub const VIRTUAL_DEVICE_NAME: &str = "tapmux virtual keyboard";

const REL_MAX: u16 = 0x0f;
const MSC_MAX: u16 = 0x07;

/// Writes event batches to the kernel device. Split out so the emit path
/// can be exercised in tests without `/dev/uinput`.
pub trait UinputWrite: Send {
    fn write(&mut self, events: &[InputEvent]) -> std::io::Result<()>;
}

impl UinputWrite for VirtualDevice {
    fn write(&mut self, events: &[InputEvent]) -> std::io::Result<()> {
        self.emit(events)
    }
}

pub struct VirtualKeyboard<D: UinputWrite = VirtualDevice> {
    device: D,
}

impl VirtualKeyboard {
    /// Create the uinput device, advertising every key code plus relative
    /// axes and misc events so mouse motion and scancode events pass
    /// through.
    pub fn new() -> Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 1..=KEY_MAX {
            keys.insert(Key::new(code));
        }
        let mut axes = AttributeSet::<RelativeAxisType>::new();
        for axis in 0..=REL_MAX {
            axes.insert(RelativeAxisType(axis));
        }
        let mut misc = AttributeSet::<MiscType>::new();
        for kind in 0..=MSC_MAX {
            misc.insert(MiscType(kind));
        }

        let device = VirtualDeviceBuilder::new()
            .context("opening /dev/uinput")?
            .name(VIRTUAL_DEVICE_NAME)
            .with_keys(&keys)
            .context("registering keys")?
            .with_relative_axes(&axes)
            .context("registering relative axes")?
            .with_msc(&misc)
            .context("registering misc events")?
            .build()
            .context("creating virtual device")?;

        // give udev a moment to recognize the new node
        thread::sleep(Duration::from_millis(200));

        Ok(Self { device })
    }
}

impl<D: UinputWrite> VirtualKeyboard<D> {
    /// Write one translated event. Whatever the resolver forwards is
    /// passed along; errors are logged, never surfaced, because the
    /// resolver does not depend on delivery.
    pub fn emit(&mut self, ev: RawEvent) {
        let event = InputEvent::new(ev.kind, ev.code, ev.value);
        if let Err(err) = self.device.write(&[event]) {
            warn!("uinput write failed: {err}");
        }
    }

    /// Release the bare modifiers. Run once at startup so a reconnect never
    /// starts with a modifier stuck from a previous session.
    pub fn release_modifiers(&mut self) {
        let modifiers = [
            Key::KEY_LEFTCTRL,
            Key::KEY_RIGHTCTRL,
            Key::KEY_LEFTSHIFT,
            Key::KEY_RIGHTSHIFT,
            Key::KEY_LEFTALT,
            Key::KEY_RIGHTALT,
            Key::KEY_LEFTMETA,
            Key::KEY_RIGHTMETA,
        ];

        let mut events: SmallVec<[InputEvent; 9]> = SmallVec::new();
        for key in modifiers {
            events.push(InputEvent::new(EventType::KEY, key.code(), 0));
        }
        events.push(InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        if let Err(err) = self.device.write(&events) {
            warn!("failed to release modifiers on startup: {err}");
        }
    }
}

/// Sink handing resolver output to the shared virtual keyboard.
pub struct LocalSink<D: UinputWrite = VirtualDevice> {
    keyboard: Arc<Mutex<VirtualKeyboard<D>>>,
}

impl<D: UinputWrite> LocalSink<D> {
    #[must_use]
    pub fn new(keyboard: Arc<Mutex<VirtualKeyboard<D>>>) -> Self {
        Self { keyboard }
    }
}

impl<D: UinputWrite> EventSink for LocalSink<D> {
    fn send(&mut self, ev: RawEvent) {
        match self.keyboard.lock() {
            Ok(mut keyboard) => keyboard.emit(ev),
            Err(_) => warn!("virtual keyboard lock poisoned, dropping event"),
        }
    }
}
