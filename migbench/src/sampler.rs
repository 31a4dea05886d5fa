//! Synchronized energy and counter sampling
//!
//! Each tick dispatches the package energy read and the counter map read as
//! two blocking tasks and waits for both. The gap between the two capture
//! instants is bounded by the slower read, not by the sum of both, which keeps
//! "instructions executed" and "energy consumed" describing the same window.
//!
//! ```text
//!   tick ──┬── spawn_blocking(read_energy)   ──┐
//!          └── spawn_blocking(read_counters) ──┴── join ── delta ── row
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use aya::maps::{HashMap, MapData, MapError};
use log::trace;
use migbench_common::{HardwareCounters, HARDWARE_COUNTER_COUNT};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

use crate::domain::MonitorError;
use crate::energy::EnergySource;
use crate::monitor::events::HardwareSample;
use crate::monitor::source::{closed_signal, EventSource};
use crate::monitor::KeyFilter;

/// Anything that can produce one aggregate counter snapshot
///
/// Implementations are called from blocking threads.
pub trait CounterSource: Send + Sync {
    /// # Errors
    /// Returns a [`MonitorError`] if the snapshot cannot be taken
    fn read_counters(&self) -> Result<HardwareCounters, MonitorError>;
}

/// Counter map shared between the hardware monitor (registration) and the sampler
pub type SharedCounterMap = Arc<Mutex<HashMap<MapData, u32, HardwareCounters>>>;

/// Reads the counter blocks of every registered group and sums them
///
/// A registered key with no entry yet reads as zero.
pub struct CounterMapReader {
    map: SharedCounterMap,
    map_name: &'static str,
    keys: KeyFilter,
}

impl CounterMapReader {
    #[must_use]
    pub fn new(map: SharedCounterMap, map_name: &'static str, keys: KeyFilter) -> Self {
        Self { map, map_name, keys }
    }
}

impl CounterSource for CounterMapReader {
    fn read_counters(&self) -> Result<HardwareCounters, MonitorError> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = [0u64; HARDWARE_COUNTER_COUNT];

        for key in self.keys.keys() {
            let counters = match map.get(&key, 0) {
                Ok(counters) => counters,
                Err(MapError::KeyNotFound) => continue,
                Err(source) => return Err(MonitorError::Map { map: self.map_name, source }),
            };
            for (sum, value) in total.iter_mut().zip(counters.to_array()) {
                *sum = sum.wrapping_add(value);
            }
        }

        Ok(HardwareCounters::from_array(total))
    }
}

/// One joint reading
#[derive(Debug, Clone, Copy)]
pub struct JointReading {
    pub energy_uj: u64,
    pub counters: HardwareCounters,
    pub energy_at: Instant,
    pub counters_at: Instant,
    /// From dispatch until both reads completed
    pub window: Duration,
}

impl JointReading {
    /// Distance between the two capture instants
    #[must_use]
    pub fn skew(&self) -> Duration {
        if self.energy_at > self.counters_at {
            self.energy_at - self.counters_at
        } else {
            self.counters_at - self.energy_at
        }
    }
}

/// Periodic joint sampler; yields one [`HardwareSample`] per tick
pub struct SynchronizedSampler<E, C> {
    energy: Arc<E>,
    counters: Arc<C>,
    interval: Duration,
    ticker: Option<Interval>,
    previous: Option<JointReading>,
    closed: watch::Receiver<bool>,
}

impl<E, C> SynchronizedSampler<E, C>
where
    E: EnergySource + 'static,
    C: CounterSource + 'static,
{
    #[must_use]
    pub fn new(energy: E, counters: C, interval: Duration, closed: watch::Receiver<bool>) -> Self {
        Self {
            energy: Arc::new(energy),
            counters: Arc::new(counters),
            interval,
            ticker: None,
            previous: None,
            closed,
        }
    }

    /// Read energy and counters concurrently
    ///
    /// # Errors
    /// [`MonitorError::Energy`] or the counter source's error; both reads
    /// always complete before either error is reported
    pub async fn read_joint(&self) -> Result<JointReading, MonitorError> {
        let energy = Arc::clone(&self.energy);
        let counters = Arc::clone(&self.counters);
        let dispatched = Instant::now();

        let (energy, counters) = tokio::join!(
            tokio::task::spawn_blocking(move || energy.read_energy().map(|v| (v, Instant::now()))),
            tokio::task::spawn_blocking(move || counters.read_counters().map(|v| (v, Instant::now()))),
        );
        let window = dispatched.elapsed();

        let (energy_uj, energy_at) = energy.map_err(|e| MonitorError::Task(e.to_string()))??;
        let (counters, counters_at) = counters.map_err(|e| MonitorError::Task(e.to_string()))??;

        Ok(JointReading { energy_uj, counters, energy_at, counters_at, window })
    }
}

impl<E, C> EventSource for SynchronizedSampler<E, C>
where
    E: EnergySource + 'static,
    C: CounterSource + 'static,
{
    type Event = HardwareSample;

    async fn next_event(&mut self) -> Result<HardwareSample, MonitorError> {
        if self.previous.is_none() {
            self.previous = Some(self.read_joint().await?);
        }

        let interval = self.interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        tokio::select! {
            _ = ticker.tick() => {}
            () = closed_signal(&mut self.closed) => return Err(MonitorError::StreamClosed),
        }

        let current = self.read_joint().await?;
        let Some(previous) = self.previous.replace(current) else {
            return Err(MonitorError::NotAttached);
        };

        trace!("Joint sample skew {:?}, window {:?}", current.skew(), current.window);
        Ok(HardwareSample {
            counters: current.counters.delta_since(&previous.counters),
            energy_uj: current.energy_uj.wrapping_sub(previous.energy_uj),
            skew: current.skew(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnergyError;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeEnergy {
        value: AtomicU64,
        delay: Duration,
    }

    impl EnergySource for FakeEnergy {
        fn read_energy(&self) -> Result<u64, EnergyError> {
            std::thread::sleep(self.delay);
            Ok(self.value.fetch_add(100, Ordering::SeqCst))
        }
    }

    struct FakeCounters {
        cycles: AtomicU64,
        delay: Duration,
    }

    impl CounterSource for FakeCounters {
        fn read_counters(&self) -> Result<HardwareCounters, MonitorError> {
            std::thread::sleep(self.delay);
            let cycles = self.cycles.fetch_add(1_000, Ordering::SeqCst);
            Ok(HardwareCounters { cycles, instructions: cycles * 2, ..Default::default() })
        }
    }

    struct BrokenEnergy;

    impl EnergySource for BrokenEnergy {
        fn read_energy(&self) -> Result<u64, EnergyError> {
            Err(EnergyError::Device {
                path: "/sys/class/powercap/intel-rapl:0/energy_uj".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn sampler(
        energy_delay: Duration,
        counter_delay: Duration,
        interval: Duration,
    ) -> (SynchronizedSampler<FakeEnergy, FakeCounters>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let energy = FakeEnergy { value: AtomicU64::new(0), delay: energy_delay };
        let counters = FakeCounters { cycles: AtomicU64::new(0), delay: counter_delay };
        (SynchronizedSampler::new(energy, counters, interval, rx), tx)
    }

    #[tokio::test]
    async fn test_sample_reports_deltas() {
        let (mut sampler, _tx) = sampler(Duration::ZERO, Duration::ZERO, Duration::from_millis(5));

        let sample = sampler.next_event().await.unwrap();
        assert_eq!(sample.energy_uj, 100);
        assert_eq!(sample.counters.cycles, 1_000);
        assert_eq!(sample.counters.instructions, 2_000);

        let sample = sampler.next_event().await.unwrap();
        assert_eq!(sample.energy_uj, 100);
        assert_eq!(sample.counters.cycles, 1_000);
    }

    #[tokio::test]
    async fn test_skew_stays_within_one_tick_under_delay() {
        let interval = Duration::from_millis(100);
        let (mut sampler, _tx) = sampler(Duration::ZERO, Duration::from_millis(30), interval);

        for _ in 0..3 {
            let sample = sampler.next_event().await.unwrap();
            assert!(sample.skew < interval, "skew {:?}", sample.skew);
        }
    }

    #[tokio::test]
    async fn test_reads_run_concurrently() {
        let delay = Duration::from_millis(60);
        let (sampler, _tx) = sampler(delay, delay, Duration::from_millis(10));

        let reading = sampler.read_joint().await.unwrap();
        assert!(reading.window >= delay);
        assert!(reading.window < delay * 2, "window {:?}", reading.window);
    }

    #[tokio::test]
    async fn test_close_stops_sampling() {
        let (mut sampler, tx) = sampler(Duration::ZERO, Duration::ZERO, Duration::from_secs(60));
        tx.send_replace(true);
        assert!(matches!(sampler.next_event().await, Err(MonitorError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_energy_failure_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let counters = FakeCounters { cycles: AtomicU64::new(0), delay: Duration::ZERO };
        let mut sampler = SynchronizedSampler::new(BrokenEnergy, counters, Duration::from_millis(1), rx);
        assert!(matches!(sampler.next_event().await, Err(MonitorError::Energy(_))));
    }
}
