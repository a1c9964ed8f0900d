//! Hidden Markov Model containers for traffic decoding.
//!
//! An [`Hmm`] is a pure value: an ordered state space, an ordered observation
//! alphabet, start probabilities, a transition matrix, and per-(state, code)
//! emission parameters. A [`ModelPair`] bundles the packet-level and
//! stream-level models, either of which may be absent.
//!
//! Models are immutable after construction. Hot-swap hands snapshots to
//! worker threads as `Arc<ModelPair>`, so replacement never mutates a model a
//! decode is reading.

use std::fmt;

/// Longest accepted state name, in bytes.
pub const MAX_STATE_NAME_LEN: usize = 63;

/// Longest accepted observation code, in bytes.
pub const MAX_OBS_CODE_LEN: usize = 7;

/// One-character tag categorising an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObsCode {
    /// `+`: payload moved away from the client end.
    ToServer,
    /// `-`: payload moved toward the client end.
    ToClient,
    /// `$`: a new stream appeared on the circuit.
    StreamNew,
    /// `F`: end-of-sequence marker.
    End,
}

impl ObsCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToServer => "+",
            Self::ToClient => "-",
            Self::StreamNew => "$",
            Self::End => "F",
        }
    }

    /// Parse a wire code. Returns `None` for anything outside the alphabet.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::ToServer),
            "-" => Some(Self::ToClient),
            "$" => Some(Self::StreamNew),
            "F" => Some(Self::End),
            _ => None,
        }
    }
}

impl fmt::Display for ObsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single committed observation: the gap to the previous committed
/// observation and the code describing what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Microseconds since the previous committed observation.
    pub delay_usec: u64,
    /// What was observed.
    pub code: ObsCode,
}

impl Observation {
    pub fn new(delay_usec: u64, code: ObsCode) -> Self {
        Self { delay_usec, code }
    }
}

/// Emission parameters for one (state, observation-code) cell.
///
/// `dp` is the probability mass for the code in this state. `sigma > 0`
/// selects a lognormal delay distribution with parameters `(mu, sigma)`;
/// otherwise `lambda > 0` selects an exponential with rate `lambda`. For the
/// terminal code only `dp` is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Emission {
    pub dp: f64,
    pub mu: f64,
    pub sigma: f64,
    pub lambda: f64,
}

impl Emission {
    pub(crate) const ZERO: Emission = Emission {
        dp: 0.0,
        mu: 0.0,
        sigma: 0.0,
        lambda: 0.0,
    };

    /// True if any parameter is set. Zero cells are omitted on re-serialisation.
    fn is_set(&self) -> bool {
        self.dp != 0.0 || self.mu != 0.0 || self.sigma != 0.0 || self.lambda != 0.0
    }
}

/// A Hidden Markov Model over delay-coded traffic observations.
///
/// Probability rows are trusted as provided; the engine does not
/// re-normalise. Zero entries mark impossible starts/transitions/emissions.
#[derive(Debug, Clone, PartialEq)]
pub struct Hmm {
    pub(crate) states: Vec<String>,
    pub(crate) obs: Vec<String>,
    pub(crate) max_state_len: usize,
    pub(crate) start: Vec<f64>,
    pub(crate) trans: Vec<Vec<f64>>,
    pub(crate) emit: Vec<Vec<Emission>>,
}

impl Hmm {
    pub(crate) fn with_spaces(states: Vec<String>, obs: Vec<String>) -> Self {
        let n = states.len();
        let m = obs.len();
        let max_state_len = states.iter().map(String::len).max().unwrap_or(0);
        Self {
            states,
            obs,
            max_state_len,
            start: vec![0.0; n],
            trans: vec![vec![0.0; n]; n],
            emit: vec![vec![Emission::ZERO; m]; n],
        }
    }

    /// Number of states.
    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Number of observation codes in the alphabet.
    pub fn num_obs(&self) -> usize {
        self.obs.len()
    }

    /// Ordered state names.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Ordered observation alphabet.
    pub fn obs_space(&self) -> &[String] {
        &self.obs
    }

    /// Name of state `i`.
    pub fn state_name(&self, i: usize) -> &str {
        &self.states[i]
    }

    /// Longest state name in bytes. Bounds the path encoder's buffer.
    pub fn max_state_name_len(&self) -> usize {
        self.max_state_len
    }

    /// Index of a state by name.
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states.iter().position(|s| s == name)
    }

    /// Index of an observation code by wire string.
    pub fn obs_index(&self, code: &str) -> Option<usize> {
        self.obs.iter().position(|o| o == code)
    }

    /// Index of an observation code in this model's alphabet.
    pub fn obs_code_index(&self, code: ObsCode) -> Option<usize> {
        self.obs_index(code.as_str())
    }

    /// Start probability of state `i`.
    pub fn start_prob(&self, i: usize) -> f64 {
        self.start[i]
    }

    /// Transition probability from state `from` to state `to`.
    pub fn trans_prob(&self, from: usize, to: usize) -> f64 {
        self.trans[from][to]
    }

    /// Emission parameters for state `i` and observation-code index `k`.
    pub fn emission(&self, i: usize, k: usize) -> &Emission {
        &self.emit[i][k]
    }

    /// Log a one-line summary at info level and the full tables at debug
    /// level. Called once per successful install.
    pub(crate) fn log_contents(&self, label: &str) {
        log::info!(
            "{label} model: {} states, alphabet [{}], longest state name {} bytes",
            self.num_states(),
            self.obs.join(" "),
            self.max_state_len,
        );
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        for (i, name) in self.states.iter().enumerate() {
            log::debug!("{label} start_prob[{name}] = {}", self.start[i]);
            for (j, dst) in self.states.iter().enumerate() {
                if self.trans[i][j] != 0.0 {
                    log::debug!("{label} trans_prob[{name}][{dst}] = {}", self.trans[i][j]);
                }
            }
            for (k, code) in self.obs.iter().enumerate() {
                let e = &self.emit[i][k];
                if e.is_set() {
                    log::debug!(
                        "{label} emit[{name}][{code}] = dp {} mu {} sigma {} lambda {}",
                        e.dp,
                        e.mu,
                        e.sigma,
                        e.lambda,
                    );
                }
            }
        }
    }

    fn write_wire(&self, out: &mut String) {
        out.push_str("{\"state_space\":[");
        for (i, s) in self.states.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
        out.push_str("];\"observation_space\":[");
        for (k, o) in self.obs.iter().enumerate() {
            if k > 0 {
                out.push(';');
            }
            out.push('"');
            out.push_str(o);
            out.push('"');
        }
        out.push_str("];\"start_probability\":{");
        let mut first = true;
        for (i, s) in self.states.iter().enumerate() {
            if self.start[i] == 0.0 {
                continue;
            }
            if !first {
                out.push(';');
            }
            first = false;
            out.push_str(&format!("\"{s}\":{}", self.start[i]));
        }
        out.push_str("};\"transition_probability\":{");
        for (i, s) in self.states.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(&format!("\"{s}\":{{"));
            let mut first = true;
            for (j, dst) in self.states.iter().enumerate() {
                if self.trans[i][j] == 0.0 {
                    continue;
                }
                if !first {
                    out.push(';');
                }
                first = false;
                out.push_str(&format!("\"{dst}\":{}", self.trans[i][j]));
            }
            out.push('}');
        }
        out.push_str("};\"emission_probability\":{");
        for (i, s) in self.states.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(&format!("\"{s}\":{{"));
            let mut first = true;
            for (k, code) in self.obs.iter().enumerate() {
                let e = &self.emit[i][k];
                if !e.is_set() {
                    continue;
                }
                if !first {
                    out.push(';');
                }
                first = false;
                if code == "F" {
                    out.push_str(&format!("\"{code}\":[{}]", e.dp));
                } else {
                    out.push_str(&format!(
                        "\"{code}\":[{};{};{};{}]",
                        e.dp, e.mu, e.sigma, e.lambda
                    ));
                }
            }
            out.push('}');
        }
        out.push_str("}}");
    }
}

/// The packet-level and stream-level models, either of which may be absent.
/// Absence disables the corresponding observation track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelPair {
    /// Model for packets within a stream (`+` / `-` / `F`).
    pub packets: Option<Hmm>,
    /// Model for streams within a circuit (`$` / `F`).
    pub streams: Option<Hmm>,
}

impl ModelPair {
    /// True when neither track has a model.
    pub fn is_empty(&self) -> bool {
        self.packets.is_none() && self.streams.is_none()
    }

    /// Re-serialise to the wire dictionary syntax accepted by the parser.
    ///
    /// Key order is canonical (spaces first, then start, transition, and
    /// emission sections); zero cells are omitted. Feeding the result back
    /// through the parser reproduces a structurally equal pair.
    pub fn to_wire_string(&self) -> String {
        let mut out = String::from("{");
        let mut first = true;
        if let Some(hmm) = &self.packets {
            out.push_str("\"packet_model\":");
            hmm.write_wire(&mut out);
            first = false;
        }
        if let Some(hmm) = &self.streams {
            if !first {
                out.push(';');
            }
            out.push_str("\"stream_model\":");
            hmm.write_wire(&mut out);
        }
        out.push('}');
        out
    }
}
