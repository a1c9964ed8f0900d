//! # cellscope-core
//!
//! **Traffic-model telemetry for anonymity relays.**
//!
//! `cellscope-core` is an in-process engine that observes cell-level events
//! on circuits and streams, coalesces them into canonical observation
//! sequences, and, when a stream or circuit terminates, runs log-space
//! Viterbi decoding against a pair of operator-supplied Hidden Markov Models
//! to recover the most probable hidden-state path. Decoded paths are handed
//! to a privacy-preserving aggregator through a caller-supplied emitter, one
//! emission per finalised sequence.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cellscope_core::{Engine, EngineConfig, PacketEvent, ViterbiEmitter};
//!
//! struct PrintEmitter;
//! impl ViterbiEmitter for PrintEmitter {
//!     fn emit_viterbi_packets(&self, path: &str) { println!("packets {path}"); }
//!     fn emit_viterbi_streams(&self, path: &str) { println!("streams {path}"); }
//! }
//!
//! let config = EngineConfig { telemetry_enabled: true, ..EngineConfig::default() };
//! let engine = Engine::new(config, Arc::new(PrintEmitter)).unwrap();
//! engine.set_traffic_model(model_blob()).unwrap();
//!
//! if let Some(mut acc) = engine.packet_accumulator() {
//!     acc.observe(PacketEvent::ToServer, 1434);
//!     acc.observe(PacketEvent::Finished, 0);
//!     drop(acc); // finalises and decodes
//! }
//! # fn model_blob() -> &'static [u8] { b"FALSE" }
//! ```
//!
//! ## Architecture
//!
//! Cell events → accumulators (coalescing) → decode dispatch → emitter
//!
//! - **Registry**: one mutex-guarded slot holds the active model-pair;
//!   hot-swap installs a new immutable snapshot without ever exposing a
//!   half-updated model.
//! - **Accumulators**: per-stream packet coalescing (1434-byte packets,
//!   2 µs simultaneity tolerance) and per-circuit stream arrivals. Dropping
//!   an accumulator finalises it.
//! - **Decoder**: log-space Viterbi over lognormal/exponential delay
//!   emissions, with the delay bucketisation the models were trained on.
//! - **Worker pool**: optional background decode threads, each holding a
//!   private model snapshot kept in sync by queued refresh jobs; completed
//!   paths drain through a self-pipe-backed reply pump.

pub mod accumulator;
pub mod engine;
pub mod model;
pub mod parse;
mod pool;
mod registry;
pub mod viterbi;

pub use accumulator::{
    PACKET_BYTE_COUNT, PACKET_TIME_TOLERANCE_USEC, PacketAccumulator, PacketEvent,
    StreamAccumulator, StreamEvent,
};
pub use engine::{Engine, EngineConfig, EngineStats, ModelUpdate, ViterbiEmitter};
pub use model::{
    Emission, Hmm, MAX_OBS_CODE_LEN, MAX_STATE_NAME_LEN, ModelPair, ObsCode, Observation,
};
pub use parse::{ModelCommand, ModelError, parse_command, parse_model_object};
pub use viterbi::{DecodeError, MAX_PATH_BYTES, decode_path, delay_bucket};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
