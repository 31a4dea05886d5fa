//! Decode-append-flush loop
//!
//! A [`Consumer`] owns one [`EventSource`] and the sink it feeds. It applies
//! the host-side allow-list, appends and flushes every accepted event, and
//! treats a closed stream as a normal stop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::Correlated;
use super::sink::RowSink;
use super::source::EventSource;
use crate::domain::MonitorError;

/// Correlation keys registered with one monitor
///
/// Events that carry a key outside this set are dropped before they reach
/// the sink. Events without a key always pass.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    keys: Arc<Mutex<HashSet<u32>>>,
}

impl KeyFilter {
    /// Returns `false` if the key was already present
    pub fn insert(&self, key: u32) -> bool {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).insert(key)
    }

    #[must_use]
    pub fn contains(&self, key: u32) -> bool {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).contains(&key)
    }

    #[must_use]
    pub fn allows(&self, key: Option<u32>) -> bool {
        key.map_or(true, |key| self.contains(key))
    }

    /// Registered keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> =
            self.keys.lock().unwrap_or_else(PoisonError::into_inner).iter().copied().collect();
        keys.sort_unstable();
        keys
    }
}

/// How a spawned consumer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Stop after the first accepted event
    SingleShot,
    /// Run until the stream closes
    Continuous,
}

/// Final report of a spawned consumer
#[derive(Debug)]
pub struct ConsumerExit {
    pub probe: &'static str,
    pub mode: ConsumeMode,
    pub rows: u64,
    pub result: Result<(), MonitorError>,
}

impl ConsumerExit {
    /// A single-shot consumer that wrote its row
    #[must_use]
    pub fn completed(&self) -> bool {
        self.result.is_ok() && (self.mode == ConsumeMode::Continuous || self.rows > 0)
    }
}

pub struct Consumer<S> {
    probe: &'static str,
    source: S,
    sink: RowSink,
    filter: KeyFilter,
    rows: u64,
    dropped: u64,
}

impl<S: EventSource> Consumer<S> {
    #[must_use]
    pub fn new(probe: &'static str, source: S, sink: RowSink, filter: KeyFilter) -> Self {
        Self { probe, source, sink, filter, rows: 0, dropped: 0 }
    }

    #[must_use]
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Events rejected by the host-side allow-list
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next accepted event and persist it
    ///
    /// Returns `Ok(false)` if the stream closed first.
    ///
    /// # Errors
    /// Decode, stream, and sink failures
    pub async fn consume_one(&mut self) -> Result<bool, MonitorError> {
        loop {
            let event = match self.source.next_event().await {
                Ok(event) => event,
                Err(MonitorError::StreamClosed) => return Ok(false),
                Err(e) => return Err(e),
            };

            if !self.filter.allows(event.correlation_key()) {
                self.dropped += 1;
                debug!("{}: dropped event for unregistered key {:?}", self.probe, event.correlation_key());
                continue;
            }

            self.sink.append(&event)?;
            self.rows += 1;
            return Ok(true);
        }
    }

    /// Persist events until the stream closes; returns the number of rows written
    ///
    /// # Errors
    /// The first decode, stream, or sink failure
    pub async fn consume_until_closed(&mut self) -> Result<u64, MonitorError> {
        while self.consume_one().await? {}
        Ok(self.rows)
    }

    /// Run to completion in `mode` and describe the outcome
    pub async fn run(mut self, mode: ConsumeMode) -> ConsumerExit {
        let result = match mode {
            ConsumeMode::SingleShot => self.consume_one().await.map(|_| ()),
            ConsumeMode::Continuous => self.consume_until_closed().await.map(|_| ()),
        };

        match &result {
            Ok(()) => info!(
                "{} consumer finished: {} row(s) in {}",
                self.probe,
                self.rows,
                self.sink.path().display()
            ),
            Err(e) => warn!("{} consumer failed after {} row(s): {e}", self.probe, self.rows),
        }

        ConsumerExit { probe: self.probe, mode, rows: self.rows, result }
    }
}

impl<S: EventSource + 'static> Consumer<S> {
    /// Run on the tokio runtime and report the exit on `exits`
    pub fn spawn(self, mode: ConsumeMode, exits: mpsc::UnboundedSender<ConsumerExit>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let exit = self.run(mode).await;
            // The orchestrator may already be gone during teardown
            let _ = exits.send(exit);
        })
    }
}
