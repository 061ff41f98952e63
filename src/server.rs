//! Serve-mode network half: resolvers push translated events into a
//! bounded queue; a server thread frames them as text lines for a single
//! active TCP client. A newer connection kicks the older one.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use crate::resolver::{EventSink, RawEvent};
use crate::wire;

/// Events queued for the network before new ones are dropped. The
/// resolver never blocks on a slow client.
const QUEUE_BOUND: usize = 1024;

/// Sink writing resolver output into the server's queue.
pub struct ServerSink {
    tx: Sender<RawEvent>,
}

impl ServerSink {
    #[must_use]
    pub fn new(tx: Sender<RawEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ServerSink {
    fn send(&mut self, ev: RawEvent) {
        if self.tx.try_send(ev).is_err() {
            warn!("network queue full, dropping event");
        }
    }
}

pub struct EventServer {
    listener: TcpListener,
    rx: Receiver<RawEvent>,
    client: Option<TcpStream>,
}

impl EventServer {
    /// Bind the listening socket and start the server thread. Returns the
    /// sender that [`ServerSink`]s are cloned from; the thread exits once
    /// every sender is dropped.
    pub fn spawn(host: &str, port: u16) -> Result<(Sender<RawEvent>, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((host, port)).with_context(|| format!("binding {host}:{port}"))?;
        listener
            .set_nonblocking(true)
            .context("configuring listener")?;
        info!("serving events on {host}:{port}");

        let (tx, rx) = bounded(QUEUE_BOUND);
        let mut server = Self {
            listener,
            rx,
            client: None,
        };
        let handle = thread::spawn(move || server.run());
        Ok((tx, handle))
    }

    fn run(&mut self) {
        loop {
            self.accept_clients();
            self.check_client();
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(ev) => self.forward(ev),
                Err(RecvTimeoutError::Timeout) => {}
                // every resolver is gone, we are shutting down
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn accept_clients(&mut self) {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                info!("client {addr} connected");
                if stream.set_nonblocking(true).is_err() {
                    warn!("failed to configure client socket");
                    return;
                }
                if self.client.replace(stream).is_some() {
                    // newest client wins, matching the reconnect workflow
                    info!("kicked previous client");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => warn!("accept failed: {err}"),
        }
    }

    /// Clients never send data; a readable socket means disconnect.
    fn check_client(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        let mut buf = [0u8; 256];
        match client.read(&mut buf) {
            Ok(0) => {
                info!("client disconnected");
                self.client = None;
            }
            Ok(_) => warn!("read unexpected bytes from client"),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!("client read failed: {err}");
                self.client = None;
            }
        }
    }

    fn forward(&mut self, ev: RawEvent) {
        let Some(client) = self.client.as_mut() else {
            // nobody listening, drop silently like any backpressured sink
            return;
        };
        let line = wire::format_event(ev);
        match client.write_all(line.as_bytes()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                // too slow; the receiver tolerates the torn line
                warn!("client not keeping up, dropping event");
            }
            Err(err) => {
                warn!("client write failed: {err}");
                self.client = None;
            }
        }
    }
}
