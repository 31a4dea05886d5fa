//! Event streams
//!
//! An [`EventSource`] yields one decoded event per call and reports
//! [`MonitorError::StreamClosed`] once the owning monitor signals close.
//! Readers poll the kernel map and park on a short sleep between empty
//! polls, racing the sleep against the close signal.

use std::collections::{HashMap as StdHashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use aya::maps::{HashMap, MapData, RingBuf};
use log::trace;
use migbench_common::LlcRecord;
use tokio::sync::watch;

use super::events::{CsvRow, Correlated, KernelEvent, LlcEvent};
use crate::domain::MonitorError;

/// Sleep between empty ring buffer polls
pub const RING_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A stream of decoded events
pub trait EventSource: Send {
    type Event: CsvRow + Correlated + Send + 'static;

    /// Wait for the next event
    ///
    /// Returns [`MonitorError::StreamClosed`] once the stream has been closed;
    /// any other error is a real failure.
    fn next_event(&mut self) -> impl Future<Output = Result<Self::Event, MonitorError>> + Send;
}

/// Resolves once `closed` reads `true` or its sender is gone
pub(crate) async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay` unless `closed` fires first; returns `false` on close
pub(crate) async fn sleep_or_closed(delay: Duration, closed: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => true,
        () = closed_signal(closed) => false,
    }
}

// ============================================================================
// Ring buffer
// ============================================================================

/// Single reader over a kernel ring buffer, decoding records as `E`
pub struct RingBufSource<E> {
    ring: RingBuf<MapData>,
    closed: watch::Receiver<bool>,
    poll_interval: Duration,
    _event: PhantomData<fn() -> E>,
}

impl<E: KernelEvent> RingBufSource<E> {
    #[must_use]
    pub fn new(ring: RingBuf<MapData>, closed: watch::Receiver<bool>) -> Self {
        Self { ring, closed, poll_interval: RING_POLL_INTERVAL, _event: PhantomData }
    }
}

impl<E: KernelEvent> EventSource for RingBufSource<E> {
    type Event = E;

    async fn next_event(&mut self) -> Result<E, MonitorError> {
        loop {
            if *self.closed.borrow() {
                return Err(MonitorError::StreamClosed);
            }

            if let Some(item) = self.ring.next() {
                let bytes: &[u8] = &item;
                trace!("{} record: {} bytes", E::PROBE, bytes.len());
                return E::decode(bytes);
            }

            if !sleep_or_closed(self.poll_interval, &mut self.closed).await {
                return Err(MonitorError::StreamClosed);
            }
        }
    }
}

// ============================================================================
// LLC stats map
// ============================================================================

/// Polls `llc_stats_map` and yields one [`LlcEvent`] per (pid, cpu) entry
/// whose counters changed since the previous poll
pub struct LlcPoller {
    map: HashMap<MapData, u64, LlcRecord>,
    map_name: &'static str,
    seen: StdHashMap<u64, LlcRecord>,
    pending: VecDeque<LlcEvent>,
    interval: Duration,
    closed: watch::Receiver<bool>,
}

impl LlcPoller {
    #[must_use]
    pub fn new(
        map: HashMap<MapData, u64, LlcRecord>,
        map_name: &'static str,
        interval: Duration,
        closed: watch::Receiver<bool>,
    ) -> Self {
        Self {
            map,
            map_name,
            seen: StdHashMap::new(),
            pending: VecDeque::new(),
            interval,
            closed,
        }
    }

    fn poll_map(&mut self) -> Result<(), MonitorError> {
        for entry in self.map.iter() {
            let (key, record) =
                entry.map_err(|source| MonitorError::Map { map: self.map_name, source })?;
            queue_if_changed(&mut self.seen, &mut self.pending, key, record);
        }
        Ok(())
    }
}

/// Remember `record` under `key` and queue it if it differs from the last value seen
fn queue_if_changed(
    seen: &mut StdHashMap<u64, LlcRecord>,
    pending: &mut VecDeque<LlcEvent>,
    key: u64,
    record: LlcRecord,
) {
    if seen.get(&key) != Some(&record) {
        seen.insert(key, record);
        pending.push_back(LlcEvent::from(record));
    }
}

impl EventSource for LlcPoller {
    type Event = LlcEvent;

    async fn next_event(&mut self) -> Result<LlcEvent, MonitorError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if *self.closed.borrow() {
                return Err(MonitorError::StreamClosed);
            }

            self.poll_map()?;

            if self.pending.is_empty() && !sleep_or_closed(self.interval, &mut self.closed).await {
                return Err(MonitorError::StreamClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_if_changed_emits_only_deltas() {
        let mut seen = StdHashMap::new();
        let mut pending = VecDeque::new();
        let record = LlcRecord { pid: 1, cpu: 0, cgroup_id: 7, read_hits: 1, ..Default::default() };

        queue_if_changed(&mut seen, &mut pending, 1 << 32, record);
        queue_if_changed(&mut seen, &mut pending, 1 << 32, record);
        assert_eq!(pending.len(), 1);

        let updated = LlcRecord { read_hits: 2, ..record };
        queue_if_changed(&mut seen, &mut pending, 1 << 32, updated);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].read.hits, 2);
    }

    #[tokio::test]
    async fn test_closed_signal_on_send() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { closed_signal(&mut rx).await });
        tx.send_replace(true);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_sleep_or_closed() {
        let (tx, mut rx) = watch::channel(false);
        assert!(sleep_or_closed(Duration::from_millis(1), &mut rx).await);

        tx.send_replace(true);
        assert!(!sleep_or_closed(Duration::from_secs(60), &mut rx).await);

        drop(tx);
        let (_, mut orphan) = watch::channel(false);
        assert!(!sleep_or_closed(Duration::from_secs(60), &mut orphan).await);
    }
}
