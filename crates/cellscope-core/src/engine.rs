//! The engine facade: configuration, registry, worker pool, and emitter.
//!
//! An [`Engine`] is constructed once by the enclosing relay with a fixed
//! [`EngineConfig`] and a [`ViterbiEmitter`] for the aggregator boundary.
//! Control blobs flow in through [`Engine::set_traffic_model`], cell events
//! through the accumulators, and decoded paths flow out through the emitter
//! with exactly one emission per finalised accumulator that reaches
//! decoding, and `[]` on any failure.
//!
//! With `decode_workers > 0` finalised sequences are queued to background
//! workers and results are delivered by the reply pump
//! ([`Engine::process_replies`]), which the host calls when the reply
//! descriptor polls readable. With no workers, decoding runs inline on the
//! calling thread.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;

use crate::accumulator::{PacketAccumulator, StreamAccumulator};
use crate::model::{ModelPair, Observation};
use crate::parse::{self, ModelCommand, ModelError};
use crate::pool::{Completed, DecodeJob, ReplyReceiver, ReplySender, Track, WorkerPool};
use crate::registry::Registry;

/// Engine settings, read once at construction from the relay's config
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch for telemetry. When false, accumulator creation returns
    /// `None` and nothing is ever recorded or emitted.
    pub telemetry_enabled: bool,
    /// Number of background decode workers. Zero decodes inline on the
    /// calling thread.
    pub decode_workers: usize,
    /// Whether the enclosing relay should report DNS-resolution events.
    /// Carried here so operators have one knob; the engine itself attaches
    /// no machinery to it.
    pub dns_resolution_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            telemetry_enabled: false,
            decode_workers: 0,
            dns_resolution_events: true,
        }
    }
}

/// What a successful model command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelUpdate {
    /// A model-pair was parsed and installed.
    Installed,
    /// The slot was cleared.
    Cleared,
}

/// Boundary to the aggregator: one call per finalised accumulator, carrying
/// the encoded path or the literal `[]` when decoding failed.
pub trait ViterbiEmitter: Send + Sync {
    fn emit_viterbi_packets(&self, path: &str);
    fn emit_viterbi_streams(&self, path: &str);
}

/// Best-effort diagnostic counters. Not all error paths decrement, by
/// design; treat these as operator diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Packet accumulators currently alive.
    pub packet_accumulators: usize,
    /// Stream accumulators currently alive.
    pub stream_accumulators: usize,
    /// Decode jobs queued to workers and not yet pumped.
    pub queued_jobs: usize,
    /// Total emissions handed to the emitter.
    pub emissions: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    packet_accumulators: AtomicUsize,
    stream_accumulators: AtomicUsize,
    queued_jobs: AtomicUsize,
    emissions: AtomicUsize,
}

impl StatsCounters {
    pub(crate) fn packet_accumulators_opened(&self) {
        self.packet_accumulators.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn packet_accumulators_closed(&self) {
        self.packet_accumulators.fetch_sub(1, Ordering::Relaxed);
    }
    pub(crate) fn stream_accumulators_opened(&self) {
        self.stream_accumulators.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn stream_accumulators_closed(&self) {
        self.stream_accumulators.fetch_sub(1, Ordering::Relaxed);
    }
    fn job_queued(&self) {
        self.queued_jobs.fetch_add(1, Ordering::Relaxed);
    }
    fn job_pumped(&self) {
        let _ = self
            .queued_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
    fn emitted(&self) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            packet_accumulators: self.packet_accumulators.load(Ordering::Relaxed),
            stream_accumulators: self.stream_accumulators.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            emissions: self.emissions.load(Ordering::Relaxed),
        }
    }
}

struct WorkerRuntime {
    pool: WorkerPool,
    replies: ReplySender,
    reply_rx: Mutex<ReplyReceiver>,
}

/// Shared interior of the engine, held by accumulators until they finalise.
pub(crate) struct EngineCore {
    config: EngineConfig,
    registry: Registry,
    emitter: Arc<dyn ViterbiEmitter>,
    workers: Option<WorkerRuntime>,
    stats: StatsCounters,
}

impl EngineCore {
    /// True iff telemetry is enabled and a model-pair is installed.
    pub(crate) fn is_active(&self) -> bool {
        self.config.telemetry_enabled && self.registry.is_loaded()
    }

    pub(crate) fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    /// Hand a finalised sequence to decoding: queued to a worker when the
    /// pool is up, inline otherwise. Absent model or absent track HMM
    /// releases the records silently.
    pub(crate) fn finalize(&self, track: Track, observations: Vec<Observation>) {
        let Some(model) = self.registry.snapshot() else {
            return;
        };
        let present = match track {
            Track::Packets => model.packets.is_some(),
            Track::Streams => model.streams.is_some(),
        };
        if !present {
            return;
        }
        match &self.workers {
            Some(rt) => {
                self.stats.job_queued();
                let job = DecodeJob {
                    track,
                    observations,
                };
                if !rt.pool.submit(job) {
                    // The worker is gone; report the job as failed so the
                    // aggregator still sees one record for this accumulator.
                    rt.replies.send(Completed { track, path: None });
                }
            }
            None => {
                let job = DecodeJob {
                    track,
                    observations,
                };
                let path = crate::pool::run_decode(&model, &job);
                self.emit(track, path.as_deref());
            }
        }
    }

    fn emit(&self, track: Track, path: Option<&str>) {
        let path = path.unwrap_or("[]");
        match track {
            Track::Packets => self.emitter.emit_viterbi_packets(path),
            Track::Streams => self.emitter.emit_viterbi_streams(path),
        }
        self.stats.emitted();
    }
}

/// The traffic-model engine. Cheap to share; all methods take `&self`.
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Build an engine. Spawns `config.decode_workers` background workers
    /// (with their reply pipe) when the pool is enabled.
    pub fn new(
        config: EngineConfig,
        emitter: Arc<dyn ViterbiEmitter>,
    ) -> std::io::Result<Engine> {
        let workers = if config.decode_workers > 0 {
            let (tx, rx) = crate::pool::reply_queue()?;
            let pool = WorkerPool::new(config.decode_workers, None, tx.clone());
            log::info!("started {} viterbi decode workers", pool.len());
            Some(WorkerRuntime {
                pool,
                replies: tx,
                reply_rx: Mutex::new(rx),
            })
        } else {
            None
        };
        Ok(Engine {
            core: Arc::new(EngineCore {
                config,
                registry: Registry::default(),
                emitter,
                workers,
                stats: StatsCounters::default(),
            }),
        })
    }

    /// Engine settings, as constructed.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Fast predicate: telemetry enabled and a model installed.
    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    /// The DNS-resolution knob for the enclosing relay's event layer.
    pub fn dns_resolution_events(&self) -> bool {
        self.core.config.dns_resolution_events
    }

    /// Apply a control blob: `TRUE <object>` installs a model-pair, anything
    /// else clears. Parsing happens outside the registry lock; on a parse
    /// error the previously installed model is retained.
    pub fn set_traffic_model(&self, blob: &[u8]) -> Result<ModelUpdate, ModelError> {
        match parse::parse_command(blob) {
            Ok(ModelCommand::Install(pair)) => {
                let snapshot = self.core.registry.install(pair);
                if let Some(hmm) = &snapshot.packets {
                    hmm.log_contents("packet");
                }
                if let Some(hmm) = &snapshot.streams {
                    hmm.log_contents("stream");
                }
                self.broadcast(Some(snapshot));
                Ok(ModelUpdate::Installed)
            }
            Ok(ModelCommand::Clear) => {
                self.core.registry.clear();
                self.broadcast(None);
                Ok(ModelUpdate::Cleared)
            }
            Err(err) => {
                log::warn!("rejecting traffic model update: {err}");
                Err(err)
            }
        }
    }

    /// Remove any installed model. Equivalent to `set_traffic_model(b"FALSE")`.
    pub fn clear_traffic_model(&self) {
        self.core.registry.clear();
        self.broadcast(None);
    }

    fn broadcast(&self, model: Option<Arc<ModelPair>>) {
        if let Some(rt) = &self.core.workers {
            rt.pool.broadcast_refresh(model);
        }
    }

    /// Current model snapshot, if one is installed.
    pub fn current_model(&self) -> Option<Arc<ModelPair>> {
        self.core.registry.snapshot()
    }

    /// Start tracking cell transfers for one stream. `None` when telemetry
    /// is inactive or no packet model is loaded, and that decision is
    /// permanent for the stream.
    pub fn packet_accumulator(&self) -> Option<PacketAccumulator> {
        if !self.core.is_active() {
            return None;
        }
        self.core.registry.snapshot()?.packets.as_ref()?;
        Some(PacketAccumulator::new(Arc::clone(&self.core)))
    }

    /// Start tracking stream arrivals for one circuit. `None` when telemetry
    /// is inactive or no stream model is loaded.
    pub fn stream_accumulator(&self) -> Option<StreamAccumulator> {
        if !self.core.is_active() {
            return None;
        }
        self.core.registry.snapshot()?.streams.as_ref()?;
        Some(StreamAccumulator::new(Arc::clone(&self.core)))
    }

    /// Descriptor that polls readable when a worker has completed a decode.
    /// `None` when the pool is disabled.
    #[cfg(unix)]
    pub fn reply_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.core
            .workers
            .as_ref()
            .map(|rt| rt.reply_rx.lock().unwrap().read_fd())
    }

    /// Drain completed decode jobs and emit their results. Returns how many
    /// were emitted. Call when the reply descriptor polls readable.
    pub fn process_replies(&self) -> usize {
        let Some(rt) = &self.core.workers else {
            return 0;
        };
        let done = rt.reply_rx.lock().unwrap().try_drain();
        self.deliver(done)
    }

    /// Like [`Engine::process_replies`] but waits up to `timeout` for the
    /// first completion. For hosts (and tests) without an event loop.
    pub fn process_replies_timeout(&self, timeout: Duration) -> usize {
        let Some(rt) = &self.core.workers else {
            return 0;
        };
        let done = rt.reply_rx.lock().unwrap().drain_timeout(timeout);
        self.deliver(done)
    }

    fn deliver(&self, done: Vec<Completed>) -> usize {
        let count = done.len();
        for completed in done {
            self.core.stats.job_pumped();
            self.core.emit(completed.track, completed.path.as_deref());
        }
        count
    }

    /// Best-effort diagnostic counters.
    pub fn stats(&self) -> EngineStats {
        self.core.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{PacketEvent, StreamEvent};

    #[derive(Default)]
    struct MockEmitter {
        packets: Mutex<Vec<String>>,
        streams: Mutex<Vec<String>>,
    }

    impl ViterbiEmitter for MockEmitter {
        fn emit_viterbi_packets(&self, path: &str) {
            self.packets.lock().unwrap().push(path.to_string());
        }
        fn emit_viterbi_streams(&self, path: &str) {
            self.streams.lock().unwrap().push(path.to_string());
        }
    }

    /// Packet model from the minimal decode scenario, with renamable states.
    fn packet_blob(prefix: &str) -> String {
        format!(
            concat!(
                "TRUE {{\"packet_model\":{{\"state_space\":[\"{p}s0\";\"{p}s1\";\"{p}End\"];",
                "\"observation_space\":[\"+\";\"-\";\"F\"];",
                "\"start_probability\":{{\"{p}s1\":0.8;\"{p}s0\":0.2}};",
                "\"transition_probability\":{{\"{p}s0\":{{\"{p}s0\":0.75;\"{p}s1\":0.25}};",
                "\"{p}s1\":{{\"{p}s0\":0.5;\"{p}End\":0.5}}}};",
                "\"emission_probability\":{{",
                "\"{p}s0\":{{\"+\":[0.8;12.0;0.01;0.0];\"-\":[0.2;5.5;3.0;0.0]}};",
                "\"{p}s1\":{{\"+\":[0.1;3.8;1.7;0.0];\"-\":[0.9;1.4;0.9;0.0]}};",
                "\"{p}End\":{{\"F\":[1.0]}}}}}}}}\r\n",
            ),
            p = prefix
        )
    }

    fn stream_blob() -> &'static str {
        concat!(
            "TRUE {\"stream_model\":{\"state_space\":[\"s0Active\";\"s1Dwell\";\"s2End\"];",
            "\"observation_space\":[\"$\";\"F\"];",
            "\"start_probability\":{\"s0Active\":0.5;\"s1Dwell\":0.5};",
            "\"transition_probability\":{",
            "\"s0Active\":{\"s2End\":0.34;\"s1Dwell\":0.165;\"s0Active\":0.495};",
            "\"s1Dwell\":{\"s2End\":0.34;\"s1Dwell\":0.495;\"s0Active\":0.165};",
            "\"s2End\":{}};",
            "\"emission_probability\":{\"s0Active\":{\"$\":[1.0;0.0;0.0;0.00015]};",
            "\"s1Dwell\":{\"$\":[1.0;14.907755;1.36;0.0]};",
            "\"s2End\":{\"F\":[1.0]}}}}\r\n",
        )
    }

    fn engine_with(workers: usize) -> (Engine, Arc<MockEmitter>) {
        let emitter = Arc::new(MockEmitter::default());
        let engine = Engine::new(
            EngineConfig {
                telemetry_enabled: true,
                decode_workers: workers,
                ..EngineConfig::default()
            },
            Arc::clone(&emitter) as Arc<dyn ViterbiEmitter>,
        )
        .expect("engine");
        (engine, emitter)
    }

    // -----------------------------------------------------------------------
    // Inline end-to-end decodes
    // -----------------------------------------------------------------------

    #[test]
    fn packet_scenario_decodes_inline() {
        let (engine, emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");

        let mut acc = engine.packet_accumulator().expect("active");
        acc.observe_at(0, PacketEvent::ToServer, 1434);
        acc.observe_at(1000, PacketEvent::ToServer, 1434);
        acc.observe_at(2000, PacketEvent::ToClient, 1434);
        acc.observe_at(3000, PacketEvent::ToClient, 1434);
        acc.observe_at(4000, PacketEvent::Finished, 0);
        drop(acc);

        assert_eq!(
            emitter.packets.lock().unwrap().as_slice(),
            ["[[\"s1\";\"+\";1000];[\"s0\";\"+\";1000];[\"s0\";\"-\";1000];[\"s1\";\"-\";1000];[\"End\";\"F\";0]]"]
        );
        assert_eq!(engine.stats().emissions, 1);
        assert_eq!(engine.stats().packet_accumulators, 0);
    }

    #[test]
    fn stream_scenario_decodes_inline() {
        let (engine, emitter) = engine_with(0);
        engine
            .set_traffic_model(stream_blob().as_bytes())
            .expect("install");

        let mut acc = engine.stream_accumulator().expect("active");
        acc.observe_at(0, StreamEvent::NewStream);
        acc.observe_at(1000, StreamEvent::NewStream);
        acc.observe_at(2000, StreamEvent::NewStream);
        acc.observe_at(3000, StreamEvent::Finished);
        drop(acc);

        assert_eq!(
            emitter.streams.lock().unwrap().as_slice(),
            ["[[\"s0Active\";\"$\";1000];[\"s0Active\";\"$\";1000];[\"s0Active\";\"$\";1000];[\"s2End\";\"F\";0]]"]
        );
    }

    #[test]
    fn terminal_only_sequence_emits_sentinel() {
        let (engine, emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");

        let mut acc = engine.packet_accumulator().expect("active");
        acc.observe_at(0, PacketEvent::Finished, 0);
        drop(acc);

        assert_eq!(emitter.packets.lock().unwrap().as_slice(), ["[]"]);
    }

    // -----------------------------------------------------------------------
    // Gating
    // -----------------------------------------------------------------------

    #[test]
    fn accumulators_require_telemetry_and_model() {
        let emitter = Arc::new(MockEmitter::default());
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::clone(&emitter) as Arc<dyn ViterbiEmitter>,
        )
        .expect("engine");

        // Telemetry disabled: no accumulators even after an install.
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");
        assert!(!engine.is_active());
        assert!(engine.packet_accumulator().is_none());

        let (engine, _emitter) = engine_with(0);
        // Enabled but no model yet.
        assert!(engine.packet_accumulator().is_none());

        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");
        assert!(engine.is_active());
        assert!(engine.packet_accumulator().is_some());
        // A packet-only pair gives no stream accumulators.
        assert!(engine.stream_accumulator().is_none());

        // Cleared again: back to none.
        engine.clear_traffic_model();
        assert!(!engine.is_active());
        assert!(engine.packet_accumulator().is_none());
    }

    #[test]
    fn accumulator_outliving_a_clear_releases_silently() {
        let (engine, emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");

        let mut acc = engine.packet_accumulator().expect("active");
        acc.observe_at(0, PacketEvent::ToServer, 1434);
        engine.clear_traffic_model();
        acc.observe_at(1000, PacketEvent::ToServer, 1434);
        drop(acc);

        assert!(emitter.packets.lock().unwrap().is_empty());
        assert_eq!(engine.stats().emissions, 0);
    }

    // -----------------------------------------------------------------------
    // Hot swap
    // -----------------------------------------------------------------------

    #[test]
    fn inline_decode_after_swap_uses_only_new_model_states() {
        let (engine, emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("a_").as_bytes())
            .expect("install a");

        let mut acc = engine.packet_accumulator().expect("active");
        for i in 0..5 {
            acc.observe_at(i * 1000, PacketEvent::ToServer, 1434);
            acc.observe_at(i * 1000 + 500, PacketEvent::ToClient, 1434);
        }
        engine
            .set_traffic_model(packet_blob("b_").as_bytes())
            .expect("install b");
        acc.observe_at(5500, PacketEvent::Finished, 0);
        drop(acc);

        let emitted = emitter.packets.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].contains("\"b_"));
        assert!(!emitted[0].contains("\"a_"));
    }

    #[test]
    fn queued_decode_before_swap_uses_only_old_model_states() {
        let (engine, emitter) = engine_with(1);
        engine
            .set_traffic_model(packet_blob("a_").as_bytes())
            .expect("install a");

        let mut acc = engine.packet_accumulator().expect("active");
        acc.observe_at(0, PacketEvent::ToServer, 1434);
        acc.observe_at(1000, PacketEvent::ToClient, 1434);
        acc.observe_at(2000, PacketEvent::Finished, 0);
        drop(acc); // queued against model A

        engine
            .set_traffic_model(packet_blob("b_").as_bytes())
            .expect("install b");

        let pumped = engine.process_replies_timeout(Duration::from_secs(10));
        assert_eq!(pumped, 1);

        let emitted = emitter.packets.lock().unwrap();
        assert_eq!(emitted.len(), 1);
        assert!(emitted[0].contains("\"a_"));
        assert!(!emitted[0].contains("\"b_"));
    }

    // -----------------------------------------------------------------------
    // Registry behaviour through the engine surface
    // -----------------------------------------------------------------------

    #[test]
    fn reinstalling_serialised_model_round_trips() {
        let (engine, _emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");
        let first = engine.current_model().expect("installed");

        let mut blob = b"TRUE ".to_vec();
        blob.extend_from_slice(first.to_wire_string().as_bytes());
        engine.set_traffic_model(&blob).expect("reinstall");
        let second = engine.current_model().expect("installed");
        assert_eq!(*first, *second);
    }

    #[test]
    fn parse_failure_retains_previous_model() {
        let (engine, _emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");
        let before = engine.current_model().expect("installed");

        let err = engine
            .set_traffic_model(b"TRUE {\"packet_model\":{\"state_space\":[")
            .expect_err("malformed");
        assert!(matches!(err, ModelError::MalformedSyntax { .. }));

        let after = engine.current_model().expect("still installed");
        assert!(Arc::ptr_eq(&before, &after));
        assert!(engine.is_active());
    }

    #[test]
    fn false_command_clears() {
        let (engine, _emitter) = engine_with(0);
        engine
            .set_traffic_model(packet_blob("").as_bytes())
            .expect("install");
        assert_eq!(
            engine.set_traffic_model(b"FALSE\r\n").expect("clear"),
            ModelUpdate::Cleared
        );
        assert!(engine.current_model().is_none());
        // Clearing twice is a no-op.
        assert_eq!(
            engine.set_traffic_model(b"FALSE\r\n").expect("clear"),
            ModelUpdate::Cleared
        );
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    #[cfg(unix)]
    #[test]
    fn reply_descriptor_follows_pool_configuration() {
        let (engine, _emitter) = engine_with(0);
        assert!(engine.reply_fd().is_none());
        let (engine, _emitter) = engine_with(2);
        assert!(engine.reply_fd().is_some());
    }

    #[test]
    fn stats_track_accumulator_lifecycles() {
        let (engine, _emitter) = engine_with(0);
        engine
            .set_traffic_model(stream_blob().as_bytes())
            .expect("install");
        let acc1 = engine.stream_accumulator().expect("active");
        let acc2 = engine.stream_accumulator().expect("active");
        assert_eq!(engine.stats().stream_accumulators, 2);
        drop(acc1);
        drop(acc2);
        assert_eq!(engine.stats().stream_accumulators, 0);
        // Both finalisations emitted (single-record sequences decode to []).
        assert_eq!(engine.stats().emissions, 2);
    }

    #[test]
    fn config_deserialises_with_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("defaults");
        assert_eq!(config, EngineConfig::default());
        assert!(config.dns_resolution_events);

        let config: EngineConfig = serde_json::from_str(
            "{\"telemetry_enabled\":true,\"decode_workers\":4,\"dns_resolution_events\":false}",
        )
        .expect("full");
        assert!(config.telemetry_enabled);
        assert_eq!(config.decode_workers, 4);
        assert!(!config.dns_resolution_events);
    }
}
