//! Input device discovery: enumerate `/dev/input`, evaluate the grab rules
//! against device names, take matching devices exclusively, and watch for
//! hot-plugged nodes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use evdev::Device;
use inotify::{Inotify, WatchMask};
use std::os::unix::io::AsRawFd;
use tracing::{debug, info, warn};

use crate::grab::GrabSet;
use crate::uinput::VIRTUAL_DEVICE_NAME;

const INPUT_DIR: &str = "/dev/input";

/// An exclusively-grabbed input device and the rule that claimed it.
pub struct GrabbedDevice {
    pub path: PathBuf,
    pub name: String,
    pub rule: usize,
    pub device: Device,
}

fn set_nonblocking(device: &Device) {
    let fd = device.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn try_grab(path: PathBuf, mut device: Device, grabs: &GrabSet) -> Option<GrabbedDevice> {
    let name = device.name().unwrap_or("").to_string();
    // never grab our own output device
    if name == VIRTUAL_DEVICE_NAME {
        return None;
    }
    let Some(rule) = grabs.match_device(&name) else {
        debug!("ignoring {name} ({})", path.display());
        return None;
    };
    if let Err(err) = device.grab() {
        warn!("failed to grab {name} ({}): {err}", path.display());
        return None;
    }
    set_nonblocking(&device);
    info!("grabbed {name} ({})", path.display());
    Some(GrabbedDevice {
        path,
        name,
        rule,
        device,
    })
}

/// Walk `/dev/input` and grab every device the rules claim.
#[must_use]
pub fn scan_devices(grabs: &GrabSet) -> Vec<GrabbedDevice> {
    evdev::enumerate()
        .filter_map(|(path, device)| try_grab(path, device, grabs))
        .collect()
}

/// Try a single node, used for hot-plugged devices.
#[must_use]
pub fn open_path(path: &Path, grabs: &GrabSet) -> Option<GrabbedDevice> {
    match Device::open(path) {
        Ok(device) => try_grab(path.to_path_buf(), device, grabs),
        Err(err) => {
            debug!("{}: {err}", path.display());
            None
        }
    }
}

/// Non-blocking inotify watch for freshly created `/dev/input/event*`
/// nodes.
pub struct DeviceWatcher {
    inotify: Inotify,
    buf: [u8; 1024],
}

impl DeviceWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init().context("initializing inotify")?;
        inotify
            .watches()
            .add(INPUT_DIR, WatchMask::CREATE)
            .with_context(|| format!("watching {INPUT_DIR}"))?;
        Ok(Self {
            inotify,
            buf: [0; 1024],
        })
    }

    /// Paths of event nodes created since the last poll.
    pub fn poll_new(&mut self) -> Vec<PathBuf> {
        let mut created = Vec::new();
        match self.inotify.read_events(&mut self.buf) {
            Ok(events) => {
                for event in events {
                    if let Some(name) = event.name.and_then(|n| n.to_str()) {
                        if name.starts_with("event") {
                            created.push(Path::new(INPUT_DIR).join(name));
                        }
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => warn!("inotify read failed: {err}"),
        }
        created
    }
}
