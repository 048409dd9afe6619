//! Event trace shared by the instrumented network primitives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::errorx::{Failure, Operation};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic id used to tag dials and connections.
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Negotiated TLS parameters, as seen by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsState {
    pub server_name: String,
    pub version: String,
    pub cipher_suite: String,
    pub negotiated_protocol: String,
    /// DER, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
}

/// One completed network operation.
#[derive(Debug, Clone)]
pub struct Event {
    pub operation: Operation,
    pub dial_id: Option<u64>,
    pub conn_id: Option<u64>,
    pub proto: Option<&'static str>,
    pub address: Option<String>,
    pub hostname: Option<String>,
    pub addresses: Vec<String>,
    pub tls: Option<TlsState>,
    pub data: Option<Vec<u8>>,
    pub num_bytes: usize,
    pub started: Instant,
    pub duration: Duration,
    pub failure: Option<Failure>,
}

impl Event {
    /// Event for an operation that began at `started` and ends now.
    pub fn new(operation: Operation, started: Instant) -> Self {
        Self {
            operation,
            dial_id: None,
            conn_id: None,
            proto: None,
            address: None,
            hostname: None,
            addresses: Vec::new(),
            tls: None,
            data: None,
            num_bytes: 0,
            started,
            duration: started.elapsed(),
            failure: None,
        }
    }

    pub fn finished(&self) -> Instant {
        self.started + self.duration
    }
}

/// Append-only event sink for one probe. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct Saver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Saver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Snapshot of the events recorded so far.
    pub fn read(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes every recorded event, leaving the saver empty.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
