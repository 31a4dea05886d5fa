//! # Kernel Event Monitors
//!
//! One [`EventMonitor`] drives one [`ProbeSet`] through the shared protocol:
//!
//! ```text
//! load ──▶ attach ──▶ register(key)* ──▶ consume_* | spawn ──▶ close
//!  │         │            │                    │                 │
//!  artifact  hooks +      kernel allow-list    decode, append,   signal, join,
//!  + sink    one reader   + host KeyFilter     flush             detach, release
//! ```
//!
//! ## Modules
//!
//! - [`probe_set`]: static description of the five artifacts
//! - [`hooks`]: program load/attach/detach
//! - [`events`]: record decoding and row schemas
//! - [`source`]: ring buffer and stats map readers
//! - [`consumer`]: the decode-append-flush loop and the host-side allow-list
//! - [`sink`]: append-only CSV output

pub mod consumer;
pub mod events;
pub mod hooks;
pub mod probe_set;
pub mod sink;
pub mod source;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use aya::maps::{HashMap, Map, MapData, RingBuf};
use aya::{Ebpf, EbpfLoader};
use log::{debug, info, warn};
use migbench_common::{HardwareCounters, BPF_ANY, BPF_NOEXIST};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cpufreq::online_cpus;
use crate::domain::{GroupId, MonitorError};
use crate::energy::{EnergySampler, PackageEnergy};
use crate::sampler::{CounterMapReader, SharedCounterMap, SynchronizedSampler};

pub use consumer::{ConsumeMode, Consumer, ConsumerExit, KeyFilter};
pub use events::{
    CsvRow, FunctionEvent, HardwareSample, KernelEvent, LlcEvent, MigrationEvent, ProcEvent,
};
pub use hooks::InstalledHook;
pub use probe_set::{
    KeyPolicy, ProbeSet, StreamKind, DEFAULT_ARTIFACT_DIR, DEFAULT_PIN_DIR,
    DEFAULT_SAMPLE_INTERVAL, LLC_POLL_INTERVAL,
};
pub use sink::RowSink;
pub use source::{EventSource, LlcPoller, RingBufSource};

/// Where artifacts live and which energy counters the hardware sampler reads
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub artifact_dir: PathBuf,
    pub pin_dir: PathBuf,
    pub energy: EnergySampler,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            pin_dir: PathBuf::from(DEFAULT_PIN_DIR),
            energy: EnergySampler::new(),
        }
    }
}

/// The reader side of an attached monitor, one variant per stream shape
enum Pipeline {
    Migration(Consumer<RingBufSource<MigrationEvent>>),
    Proc(Consumer<RingBufSource<ProcEvent>>),
    Function(Consumer<RingBufSource<FunctionEvent>>),
    Llc(Consumer<LlcPoller>),
    Hardware(Consumer<SynchronizedSampler<PackageEnergy, CounterMapReader>>),
}

macro_rules! with_consumer {
    ($pipeline:expr, $consumer:ident => $body:expr) => {
        match $pipeline {
            Pipeline::Migration($consumer) => $body,
            Pipeline::Proc($consumer) => $body,
            Pipeline::Function($consumer) => $body,
            Pipeline::Llc($consumer) => $body,
            Pipeline::Hardware($consumer) => $body,
        }
    };
}

/// A loaded kernel artifact, its hooks, its reader and its sink
pub struct EventMonitor {
    probe_set: ProbeSet,
    energy: EnergySampler,
    bpf: Option<Ebpf>,
    sink: Option<RowSink>,
    links: Vec<InstalledHook>,
    pipeline: Option<Pipeline>,
    counter_map: Option<SharedCounterMap>,
    filter: KeyFilter,
    closed_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Load the artifact for `probe_set` and open its output sink at `sink_path`
    ///
    /// # Errors
    /// [`MonitorError::PinDir`], [`MonitorError::Load`] or [`MonitorError::Sink`]
    pub fn load(
        probe_set: ProbeSet,
        options: &MonitorOptions,
        sink_path: impl AsRef<Path>,
    ) -> Result<Self, MonitorError> {
        let artifact = probe_set.artifact_path(&options.artifact_dir);

        let mut loader = EbpfLoader::new();
        if probe_set.uses_pinned_maps() {
            fs::create_dir_all(&options.pin_dir).map_err(|source| MonitorError::PinDir {
                path: options.pin_dir.clone(),
                source,
            })?;
            loader.map_pin_path(&options.pin_dir);
        }
        let bpf = loader
            .load_file(&artifact)
            .map_err(|source| MonitorError::Load { artifact: artifact.clone(), source })?;
        info!("✓ Loaded {}", artifact.display());

        let sink = match probe_set {
            ProbeSet::Migration => RowSink::open::<MigrationEvent>(sink_path)?,
            ProbeSet::Llc => RowSink::open::<LlcEvent>(sink_path)?,
            ProbeSet::Hardware { .. } => RowSink::open::<HardwareSample>(sink_path)?,
            ProbeSet::Proc => RowSink::open::<ProcEvent>(sink_path)?,
            ProbeSet::Function { .. } => RowSink::open::<FunctionEvent>(sink_path)?,
        };

        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            probe_set,
            energy: options.energy.clone(),
            bpf: Some(bpf),
            sink: Some(sink),
            links: Vec::new(),
            pipeline: None,
            counter_map: None,
            filter: KeyFilter::default(),
            closed_tx,
            task: None,
        })
    }

    #[must_use]
    pub fn probe_set(&self) -> &ProbeSet {
        &self.probe_set
    }

    /// Keys registered so far, sorted
    #[must_use]
    pub fn registered_keys(&self) -> Vec<u32> {
        self.filter.keys()
    }

    /// Output file while the sink is still held here, i.e. before `attach` succeeds
    #[must_use]
    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_ref().map(RowSink::path)
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.pipeline.is_some() || self.task.is_some()
    }

    /// Install every hook and open the reader
    ///
    /// A failing hook leaves the hooks installed before it in place; call
    /// [`EventMonitor::close`] to release them.
    ///
    /// # Errors
    /// [`MonitorError::Attach`], [`MonitorError::ProgramNotFound`],
    /// [`MonitorError::MapNotFound`] or [`MonitorError::Topology`]
    pub fn attach(&mut self) -> Result<(), MonitorError> {
        let bpf = self.bpf.as_mut().ok_or(MonitorError::NotAttached)?;
        if self.sink.is_none() {
            return Err(MonitorError::NotAttached);
        }

        let per_cpu = self
            .probe_set
            .hooks()
            .iter()
            .any(|hook| matches!(hook.point, probe_set::HookPoint::PerfEvent(_)));
        let cpus = if per_cpu { online_cpus().map_err(MonitorError::Topology)? } else { Vec::new() };

        hooks::install(bpf, &self.probe_set, &cpus, &mut self.links)?;

        let closed = self.closed_tx.subscribe();
        let name = self.probe_set.name();
        let stream = self.probe_set.stream();
        let map_name = stream.map();
        let filter = self.filter.clone();

        let pipeline = match &self.probe_set {
            ProbeSet::Migration => Pipeline::Migration(Consumer::new(
                name,
                RingBufSource::new(ring_buf(bpf, map_name)?, closed),
                take_sink(&mut self.sink)?,
                filter,
            )),
            ProbeSet::Proc => Pipeline::Proc(Consumer::new(
                name,
                RingBufSource::new(ring_buf(bpf, map_name)?, closed),
                take_sink(&mut self.sink)?,
                filter,
            )),
            ProbeSet::Function { .. } => Pipeline::Function(Consumer::new(
                name,
                RingBufSource::new(ring_buf(bpf, map_name)?, closed),
                take_sink(&mut self.sink)?,
                filter,
            )),
            ProbeSet::Llc => {
                let map = HashMap::try_from(take_map(bpf, map_name)?)
                    .map_err(|source| MonitorError::Map { map: map_name, source })?;
                Pipeline::Llc(Consumer::new(
                    name,
                    LlcPoller::new(map, map_name, LLC_POLL_INTERVAL, closed),
                    take_sink(&mut self.sink)?,
                    filter,
                ))
            }
            ProbeSet::Hardware { sample_interval } => {
                let map: HashMap<MapData, u32, HardwareCounters> =
                    HashMap::try_from(take_map(bpf, map_name)?)
                        .map_err(|source| MonitorError::Map { map: map_name, source })?;
                let map = Arc::new(Mutex::new(map));
                self.counter_map = Some(Arc::clone(&map));

                let reader = CounterMapReader::new(map, map_name, filter.clone());
                let sampler =
                    SynchronizedSampler::new(self.energy.package(), reader, *sample_interval, closed);
                Pipeline::Hardware(Consumer::new(name, sampler, take_sink(&mut self.sink)?, filter))
            }
        };

        self.pipeline = Some(pipeline);
        debug!("{name}: reader open on {map_name}");
        Ok(())
    }

    /// Add `group` to this monitor's allow-list
    ///
    /// # Errors
    /// [`MonitorError::Registration`] if the kernel map rejects the key,
    /// including a duplicate key for exclusive probe sets
    pub fn register(&mut self, group: GroupId) -> Result<(), MonitorError> {
        let key = group.map_key();

        match self.probe_set.key_policy() {
            KeyPolicy::Exclusive { map } => self.insert_flag(map, key, BPF_NOEXIST)?,
            KeyPolicy::Upsert { map } => self.insert_flag(map, key, BPF_ANY)?,
            KeyPolicy::ZeroedCounters { map } => self.zero_counters(map, key)?,
            KeyPolicy::HostOnly => {
                debug!("{}: no kernel allow-list, tracking {group} host-side", self.probe_set);
            }
        }

        if !self.filter.insert(key) {
            debug!("{}: key {key} already tracked", self.probe_set);
        }
        info!("✓ Registered {group} with {} monitor", self.probe_set);
        Ok(())
    }

    fn insert_flag(&mut self, map: &'static str, key: u32, flags: u64) -> Result<(), MonitorError> {
        let bpf = self.bpf.as_mut().ok_or(MonitorError::NotAttached)?;
        let mut allow: HashMap<_, u32, u8> =
            HashMap::try_from(bpf.map_mut(map).ok_or(MonitorError::MapNotFound(map))?)
                .map_err(|source| MonitorError::Map { map, source })?;
        allow.insert(key, 1, flags).map_err(|source| MonitorError::Registration { key, map, source })
    }

    fn zero_counters(&mut self, map: &'static str, key: u32) -> Result<(), MonitorError> {
        let zeroed = HardwareCounters::default();
        let registration = |source| MonitorError::Registration { key, map, source };

        // Once attached the counter map is owned by the sampler
        if let Some(shared) = &self.counter_map {
            let mut counters = shared.lock().unwrap_or_else(PoisonError::into_inner);
            return counters.insert(key, zeroed, BPF_ANY).map_err(registration);
        }

        let bpf = self.bpf.as_mut().ok_or(MonitorError::NotAttached)?;
        let mut counters: HashMap<_, u32, HardwareCounters> =
            HashMap::try_from(bpf.map_mut(map).ok_or(MonitorError::MapNotFound(map))?)
                .map_err(|source| MonitorError::Map { map, source })?;
        counters.insert(key, zeroed, BPF_ANY).map_err(registration)
    }

    /// Block for one accepted event and persist it; `Ok(false)` if the stream closed
    ///
    /// # Errors
    /// [`MonitorError::NotAttached`] before `attach` or after `spawn`, and any
    /// decode, stream or sink failure
    pub async fn consume_one(&mut self) -> Result<bool, MonitorError> {
        let pipeline = self.pipeline.as_mut().ok_or(MonitorError::NotAttached)?;
        with_consumer!(pipeline, consumer => consumer.consume_one().await)
    }

    /// Persist events until [`EventMonitor::close`] is called from elsewhere
    ///
    /// # Errors
    /// As [`EventMonitor::consume_one`]
    pub async fn consume_until_closed(&mut self) -> Result<u64, MonitorError> {
        let pipeline = self.pipeline.as_mut().ok_or(MonitorError::NotAttached)?;
        with_consumer!(pipeline, consumer => consumer.consume_until_closed().await)
    }

    /// Move the reader to a tokio task; its [`ConsumerExit`] is sent on `exits`
    ///
    /// # Errors
    /// [`MonitorError::NotAttached`] if no reader is open
    pub fn spawn(
        &mut self,
        mode: ConsumeMode,
        exits: mpsc::UnboundedSender<ConsumerExit>,
    ) -> Result<(), MonitorError> {
        let pipeline = self.pipeline.take().ok_or(MonitorError::NotAttached)?;
        let task = with_consumer!(pipeline, consumer => consumer.spawn(mode, exits));
        debug!("{}: consumer spawned ({mode:?})", self.probe_set);
        self.task = Some(task);
        Ok(())
    }

    /// Close the reader, detach hooks in reverse order, release the artifact
    ///
    /// Every step runs; the first failure is returned. Closing twice is a no-op.
    ///
    /// # Errors
    /// [`MonitorError::Task`] if the consumer task panicked, or
    /// [`MonitorError::Detach`]
    pub async fn close(&mut self) -> Result<(), MonitorError> {
        let mut first_err = None;

        self.closed_tx.send_replace(true);
        self.pipeline = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("⚠️  {} consumer task failed: {e}", self.probe_set);
                first_err.get_or_insert(MonitorError::Task(e.to_string()));
            }
        }

        if let Some(bpf) = self.bpf.as_mut() {
            if let Err(e) = hooks::detach_all(bpf, &mut self.links) {
                first_err.get_or_insert(e);
            }
        }

        self.counter_map = None;
        self.sink = None;
        if self.bpf.take().is_some() {
            info!("✓ Closed {} monitor", self.probe_set);
        }

        first_err.map_or(Ok(()), Err)
    }
}

fn take_sink(sink: &mut Option<RowSink>) -> Result<RowSink, MonitorError> {
    sink.take().ok_or(MonitorError::NotAttached)
}

fn take_map(bpf: &mut Ebpf, name: &'static str) -> Result<Map, MonitorError> {
    bpf.take_map(name).ok_or(MonitorError::MapNotFound(name))
}

fn ring_buf(bpf: &mut Ebpf, name: &'static str) -> Result<RingBuf<MapData>, MonitorError> {
    RingBuf::try_from(take_map(bpf, name)?).map_err(|source| MonitorError::Map { map: name, source })
}
