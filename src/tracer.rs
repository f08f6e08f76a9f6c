//! Per-request trace events.
//!
//! Events carry process-wide indices. The first block is predefined; user
//! events are allocated during initialization only — once
//! [`finish_initialization`] runs, registration is closed. Each request
//! carries a [`TraceInfo`] recording the latest occurrence of every event it
//! is gated to observe, plus a stack of started-but-unfinished events so a
//! request that dies mid-flight still emits its finish records during
//! cleanup.

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Gating level for event recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Base = 1,
    Detailed = 2,
}

/// A registered trace event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    index: usize,
    level: Level,
}

impl Event {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

macro_rules! predefined {
    ($($name:ident = $index:expr, $level:expr;)*) => {
        $(pub const $name: Event = Event { index: $index, level: $level };)*
    };
}

predefined! {
    HTTP_START = 1, Level::Base;
    HTTP_FINISH = 2, Level::Base;
    READ_HEADER_START = 3, Level::Detailed;
    READ_HEADER_FINISH = 4, Level::Detailed;
    READ_BODY_START = 5, Level::Detailed;
    READ_BODY_FINISH = 6, Level::Detailed;
    SERVER_HANDLE_START = 7, Level::Detailed;
    SERVER_HANDLE_FINISH = 8, Level::Detailed;
    WRITE_START = 9, Level::Detailed;
    WRITE_FINISH = 10, Level::Detailed;
}

const PREDEFINED_EVENT_NUM: usize = 11;

/// The finish counterpart of a start event.
fn finish_of(event: Event) -> Option<Event> {
    match event.index {
        1 => Some(HTTP_FINISH),
        3 => Some(READ_HEADER_FINISH),
        5 => Some(READ_BODY_FINISH),
        7 => Some(SERVER_HANDLE_FINISH),
        9 => Some(WRITE_FINISH),
        _ => None,
    }
}

#[derive(Debug)]
pub enum RegisterError {
    /// The name is taken; the existing event is returned for reuse.
    Duplicate(Event),
    /// Registration window is closed.
    NotAllowed,
}

struct RegistryInner {
    names: Vec<(String, Event)>,
    next_index: usize,
    finished: bool,
}

static REGISTRY: OnceLock<Mutex<RegistryInner>> = OnceLock::new();

fn registry() -> &'static Mutex<RegistryInner> {
    REGISTRY.get_or_init(|| {
        Mutex::new(RegistryInner {
            names: Vec::new(),
            next_index: PREDEFINED_EVENT_NUM,
            finished: false,
        })
    })
}

/// Registers a user event during the initialization window.
pub fn register(name: &str, level: Level) -> Result<Event, RegisterError> {
    let mut inner = registry().lock().unwrap_or_else(|e| e.into_inner());
    if inner.finished {
        return Err(RegisterError::NotAllowed);
    }
    if let Some((_, event)) = inner.names.iter().find(|(n, _)| n == name) {
        return Err(RegisterError::Duplicate(*event));
    }
    let event = Event {
        index: inner.next_index,
        level,
    };
    inner.next_index += 1;
    inner.names.push((name.to_owned(), event));
    Ok(event)
}

/// Closes the registration window.
pub fn finish_initialization() {
    let mut inner = registry().lock().unwrap_or_else(|e| e.into_inner());
    inner.finished = true;
}

/// Total number of allocated event indices, predefined included.
pub fn event_count() -> usize {
    let inner = registry().lock().unwrap_or_else(|e| e.into_inner());
    inner.next_index
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Start,
    Finish,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub event: Event,
    pub status: EventStatus,
    pub info: Option<String>,
    pub time: Instant,
}

/// Per-request event recorder.
pub struct TraceInfo {
    stats: Vec<Option<Record>>,
    stack: Vec<Event>,
    level: Level,
    enabled: bool,
}

impl TraceInfo {
    pub fn new(level: Level, enabled: bool) -> TraceInfo {
        let size = if enabled { event_count() } else { 0 };
        TraceInfo {
            stats: vec![None; size],
            stack: Vec::new(),
            level,
            enabled,
        }
    }

    pub fn disabled() -> TraceInfo {
        TraceInfo::new(Level::Base, false)
    }

    fn gated(&self, event: Event) -> bool {
        self.enabled && event.level <= self.level && event.index < self.stats.len()
    }

    /// Records an event occurrence, keeping only the most recent per index.
    pub fn record(&mut self, event: Event, status: EventStatus, info: Option<String>) {
        if !self.gated(event) {
            return;
        }
        self.stats[event.index] = Some(Record {
            event,
            status,
            info,
            time: Instant::now(),
        });
    }

    /// Records a start event and remembers it for deferred cleanup.
    pub fn start(&mut self, event: Event) {
        if !self.gated(event) {
            return;
        }
        self.record(event, EventStatus::Start, None);
        self.stack.push(event);
    }

    /// Records a finish event, popping its start off the pending stack.
    pub fn finish(&mut self, event: Event) {
        self.record(event, EventStatus::Finish, None);
        if let Some(pos) = self.stack.iter().rposition(|e| finish_of(*e) == Some(event)) {
            self.stack.remove(pos);
        }
    }

    /// Emits finish records for every start still pending, innermost first.
    pub fn flush_pending(&mut self) {
        while let Some(started) = self.stack.pop() {
            if let Some(finish) = finish_of(started) {
                if self.gated(finish) {
                    self.stats[finish.index] = Some(Record {
                        event: finish,
                        status: EventStatus::Finish,
                        info: None,
                        time: Instant::now(),
                    });
                }
            }
        }
    }

    pub fn get(&self, event: Event) -> Option<&Record> {
        self.stats.get(event.index).and_then(|r| r.as_ref())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
