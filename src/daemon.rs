//! The supervisor: owns every grabbed device and its resolver, runs the
//! poll loop, and hosts the `local` / `serve` / `connect` entry points.
//!
//! One resolver exists per grab rule; every device matching that rule
//! feeds it through the dedup front end, so several halves of one physical
//! keyboard (or several keyboards sharing a rule) behave as one.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use evdev::EventType;
use signal_hook::consts::{SIGINT, SIGTERM};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::devices::{open_path, scan_devices, DeviceWatcher};
use crate::grab::GrabSet;
use crate::names;
use crate::resolver::{EventSink, RawEvent, Resolver};
use crate::server::{EventServer, ServerSink};
use crate::time_util::{Clock, SystemClock};
use crate::uinput::{LocalSink, VirtualKeyboard};
use crate::wire;

/// Runtime failures split by exit code: startup problems exit 1, fatal
/// I/O during operation exits 2. Normal (signal/timeout) termination
/// exits 0.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("{0:#}")]
    Startup(anyhow::Error),
    #[error("{0:#}")]
    Io(anyhow::Error),
}

impl DaemonError {
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Startup(_) => 1,
            Self::Io(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaemonOpts {
    /// Exit after this many seconds (testing aid).
    pub timeout: Option<u64>,
    /// Send systemd readiness notifications.
    pub systemd: bool,
}

/// SIGINT/SIGTERM set the returned flag; the poll loops check it.
pub fn install_signal_handlers() -> anyhow::Result<Arc<AtomicBool>> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&term))
            .context("registering signal handler")?;
    }
    Ok(term)
}

/// Grab matching keyboards and remap them into a local virtual device.
pub fn run_local(config: &Config, opts: &DaemonOpts, term: &AtomicBool) -> Result<(), DaemonError> {
    let keyboard = VirtualKeyboard::new().map_err(DaemonError::Startup)?;
    let keyboard = Arc::new(Mutex::new(keyboard));
    if let Ok(mut kb) = keyboard.lock() {
        kb.release_modifiers();
    }
    let mut make_sink =
        || Box::new(LocalSink::new(Arc::clone(&keyboard))) as Box<dyn EventSink>;
    run_supervisor(&config.grabs, &mut make_sink, opts, term)
}

/// Grab matching keyboards and serve translated events over TCP.
pub fn run_serve(
    config: &Config,
    host: &str,
    port: u16,
    opts: &DaemonOpts,
    term: &AtomicBool,
) -> Result<(), DaemonError> {
    let (tx, server) = EventServer::spawn(host, port).map_err(DaemonError::Startup)?;
    let result = {
        let mut make_sink = || Box::new(ServerSink::new(tx.clone())) as Box<dyn EventSink>;
        run_supervisor(&config.grabs, &mut make_sink, opts, term)
    };
    // the server thread exits once the last sender is gone
    drop(tx);
    let _ = server.join();
    result
}

/// Read framed events from a server and replay them into a local virtual
/// device.
pub fn run_connect(
    host: &str,
    port: u16,
    opts: &DaemonOpts,
    term: &AtomicBool,
) -> Result<(), DaemonError> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("connecting to {host}:{port}"))
        .map_err(DaemonError::Startup)?;
    let mut keyboard = VirtualKeyboard::new().map_err(DaemonError::Startup)?;
    keyboard.release_modifiers();

    if opts.systemd {
        notify_ready();
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let result = loop {
        if term.load(Ordering::Relaxed) {
            break Ok(());
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                info!("server closed the event stream");
                break Ok(());
            }
            Ok(_) => match wire::parse_event(&line) {
                Some(ev) => keyboard.emit(ev),
                None => debug!("ignoring malformed line"),
            },
            // a signal interrupted the read; the loop re-checks the flag
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                break Err(DaemonError::Io(
                    anyhow::Error::new(err).context("reading event stream"),
                ))
            }
        }
    };

    if opts.systemd {
        notify_stopping();
    }
    result
}

fn run_supervisor(
    grabs: &GrabSet,
    make_sink: &mut dyn FnMut() -> Box<dyn EventSink>,
    opts: &DaemonOpts,
    term: &AtomicBool,
) -> Result<(), DaemonError> {
    // let the user release the key that launched us before grabbing
    thread::sleep(Duration::from_millis(250));

    let mut devices = scan_devices(grabs);
    if devices.is_empty() {
        return Err(DaemonError::Startup(anyhow!(
            "no input device matched any grab rule"
        )));
    }
    let mut watcher = DeviceWatcher::new().map_err(DaemonError::Startup)?;

    let mut resolvers: HashMap<usize, Resolver> = HashMap::new();
    for dev in &devices {
        if let Some(tree) = grabs.tree(dev.rule) {
            resolvers
                .entry(dev.rule)
                .or_insert_with(|| Resolver::new(tree, make_sink()));
        }
    }

    if opts.systemd {
        notify_ready();
    }
    let exit_at = opts
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let clock = SystemClock;

    while !term.load(Ordering::Relaxed) {
        if exit_at.is_some_and(|at| Instant::now() >= at) {
            info!("exiting after --timeout");
            break;
        }

        for path in watcher.poll_new() {
            if devices.iter().any(|dev| dev.path == path) {
                continue;
            }
            if let Some(dev) = open_path(&path, grabs) {
                if let Some(tree) = grabs.tree(dev.rule) {
                    resolvers
                        .entry(dev.rule)
                        .or_insert_with(|| Resolver::new(tree, make_sink()));
                    devices.push(dev);
                }
            }
        }

        let mut saw_events = false;
        let mut lost: Vec<usize> = Vec::new();
        for (index, dev) in devices.iter_mut().enumerate() {
            let Some(resolver) = resolvers.get_mut(&dev.rule) else {
                continue;
            };
            match dev.device.fetch_events() {
                Ok(events) => {
                    for ev in events {
                        saw_events = true;
                        let ev = raw_event(&ev);
                        if ev.kind == EventType::KEY && ev.value == 1 {
                            if let Some(name) = names::name_from_code(ev.code) {
                                debug!("{name}");
                            }
                        }
                        resolver.dedup_push(ev);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!("lost {} ({}): {err}", dev.name, dev.path.display());
                    lost.push(index);
                }
            }
        }
        for index in lost.into_iter().rev() {
            let dev = devices.swap_remove(index);
            if !devices.iter().any(|other| other.rule == dev.rule) {
                // last device on this rule: make sure nothing stays held
                if let Some(resolver) = resolvers.get_mut(&dev.rule) {
                    resolver.release_held(clock.now());
                }
            }
        }

        let now = clock.now();
        for resolver in resolvers.values_mut() {
            if resolver.next_deadline().is_some_and(|at| at <= now) {
                resolver.tick();
            }
        }

        if !saw_events {
            thread::sleep(Duration::from_millis(1));
        }
    }

    if opts.systemd {
        notify_stopping();
    }

    let now = clock.now();
    for resolver in resolvers.values_mut() {
        resolver.release_held(now);
    }
    for dev in &mut devices {
        if let Err(err) = dev.device.ungrab() {
            debug!("ungrab {}: {err}", dev.name);
        }
    }
    Ok(())
}

fn raw_event(ev: &evdev::InputEvent) -> RawEvent {
    RawEvent::new(ev.event_type(), ev.code(), ev.value(), ev.timestamp().into())
}

fn notify_ready() {
    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        debug!("sd_notify: {err}");
    }
}

fn notify_stopping() {
    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]) {
        debug!("sd_notify: {err}");
    }
}
