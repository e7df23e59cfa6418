//! Loopback transport for agent messages.
//!
//! The agent connects back to `127.0.0.1:<port>` and writes one JSON object
//! per line. The pump accepts a single connection, decodes each line into an
//! [`AgentMessage`] and hands it to the registered handler on the pump's own
//! thread. When the connection ends the pump is marked closed.

use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::session::{AgentMessage, MessageHandler};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

pub struct MessagePump {
    listener: Option<TcpListener>,
    addr: SocketAddr,
    flags: Arc<Flags>,
    thread: Option<JoinHandle<()>>,
}

impl MessagePump {
    /// Listen on `127.0.0.1:port`. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener: Some(listener),
            addr,
            flags: Arc::new(Flags::default()),
            thread: None,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Start accepting and dispatching to `handler`.
    pub fn start(&mut self, handler: MessageHandler) -> Result<()> {
        let Some(listener) = self.listener.take() else {
            return Err(Error::Instrumentation("message pump already started".to_string()));
        };
        let flags = Arc::clone(&self.flags);
        let thread = thread::Builder::new()
            .name("nightwatch-pump".to_string())
            .spawn(move || {
                if let Err(e) = pump(&listener, &flags, &handler) {
                    debug!("Message pump ended: {}", e);
                }
                flags.closed.store(true, Ordering::SeqCst);
            })?;
        self.thread = Some(thread);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    /// Block until the agent connects, the pump closes or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(timeout));
        }
        self.is_connected()
    }

    /// Stop the pump thread and wait for it.
    pub fn shutdown(&mut self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Message pump thread panicked");
        }
        self.flags.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for MessagePump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump(listener: &TcpListener, flags: &Flags, handler: &MessageHandler) -> io::Result<()> {
    let stream = loop {
        if flags.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Agent connected from {}", peer);
                break stream;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(e),
        }
    };
    flags.connected.store(true, Ordering::SeqCst);
    read_messages(stream, flags, handler)
}

fn read_messages(stream: TcpStream, flags: &Flags, handler: &MessageHandler) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut reader = BufReader::new(stream);
    // Partial lines survive read timeouts and are completed on the next read
    let mut line = String::new();

    while !flags.stop.load(Ordering::SeqCst) {
        match reader.read_line(&mut line) {
            Ok(0) => {
                debug!("Agent closed the connection");
                return Ok(());
            }
            Ok(_) => {
                dispatch(line.trim(), handler);
                line.clear();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn dispatch(line: &str, handler: &MessageHandler) {
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<AgentMessage>(line) {
        Ok(message) => handler(message),
        Err(e) => debug!("Dropping malformed agent message: {}", e),
    }
}
