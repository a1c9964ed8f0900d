//! Log-space Viterbi decoding of observation sequences.
//!
//! Probabilities are carried in log space throughout; linear-space scoring
//! underflows after a few hundred observations. Negative infinity marks
//! impossible starts, transitions, and emissions, and an unreachable cell
//! keeps its "no predecessor" sentinel so an infeasible path is detected
//! instead of silently indexed.
//!
//! Observed delays are de-noised onto log-spaced buckets before scoring
//! ([`delay_bucket`]). Models are trained against the same bucketisation, so
//! it must be replicated exactly, integer truncation included.

use thiserror::Error;

use crate::model::{Hmm, ObsCode, Observation};

/// sqrt(2 * pi), matching the constant the models were trained against.
const SQRT_2_PI: f64 = 2.5066282746310002;

/// Hard cap on the encoded path string. Oversize results are discarded to
/// protect the downstream control channel.
pub const MAX_PATH_BYTES: usize = 200 * 1024 * 1024;

const NO_PREDECESSOR: usize = usize::MAX;

/// Why a decode produced no path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The sequence needs at least one content record plus the terminal
    /// record.
    #[error("observation sequence of length {0} is too short to decode")]
    TooShort(usize),
    /// An observation code does not appear in the model's alphabet.
    #[error("observation code '{0}' is not in the model's alphabet")]
    CodeOutsideAlphabet(ObsCode),
    /// No state path with positive probability exists.
    #[error("no feasible state path for the observation sequence")]
    Infeasible,
    /// The encoded path would exceed [`MAX_PATH_BYTES`].
    #[error("encoded path exceeds the output size cap")]
    OversizeOutput,
}

/// Decode the most probable hidden-state path and encode it as
/// `[[state;code;delay];…]`.
pub fn decode_path(hmm: &Hmm, observations: &[Observation]) -> Result<String, DecodeError> {
    let path = most_probable_path(hmm, observations)?;
    encode_path_capped(hmm, &path, observations, MAX_PATH_BYTES)
}

/// Run the Viterbi recurrence and return state indices, one per observation.
fn most_probable_path(hmm: &Hmm, observations: &[Observation]) -> Result<Vec<usize>, DecodeError> {
    let n_states = hmm.num_states();
    let n_obs = observations.len();
    if n_obs < 2 {
        return Err(DecodeError::TooShort(n_obs));
    }

    let obs_indices = observations
        .iter()
        .map(|o| {
            hmm.obs_code_index(o.code)
                .ok_or(DecodeError::CodeOutsideAlphabet(o.code))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // max_logp[i][o] is the best log-probability of any path ending in state
    // i at observation o; prev_state[i][o] is the predecessor achieving it.
    let mut max_logp = vec![vec![f64::NEG_INFINITY; n_obs]; n_states];
    let mut prev_state = vec![vec![NO_PREDECESSOR; n_obs]; n_states];

    let first = &observations[0];
    let dx = delay_bucket(first.delay_usec);
    for i in 0..n_states {
        let pi = hmm.start_prob(i);
        if pi <= 0.0 {
            continue;
        }
        let emit = emission_logp(hmm, i, obs_indices[0], first.code, dx);
        if emit.is_finite() {
            max_logp[i][0] = pi.ln() + emit;
        }
    }

    for o in 1..n_obs {
        let obs = &observations[o];
        let dx = delay_bucket(obs.delay_usec);
        for i in 0..n_states {
            let emit = emission_logp(hmm, i, obs_indices[o], obs.code, dx);
            if emit == f64::NEG_INFINITY {
                continue;
            }
            let mut best = f64::NEG_INFINITY;
            let mut best_prev = NO_PREDECESSOR;
            for j in 0..n_states {
                let a = hmm.trans_prob(j, i);
                if a <= 0.0 || max_logp[j][o - 1] == f64::NEG_INFINITY {
                    continue;
                }
                let logp = max_logp[j][o - 1] + a.ln();
                if logp > best {
                    best = logp;
                    best_prev = j;
                }
            }
            if best_prev == NO_PREDECESSOR {
                continue;
            }
            max_logp[i][o] = best + emit;
            prev_state[i][o] = best_prev;
        }
    }

    let mut final_state = NO_PREDECESSOR;
    let mut final_logp = f64::NEG_INFINITY;
    for (i, row) in max_logp.iter().enumerate() {
        if row[n_obs - 1] > final_logp {
            final_logp = row[n_obs - 1];
            final_state = i;
        }
    }
    if final_state == NO_PREDECESSOR {
        return Err(DecodeError::Infeasible);
    }

    let mut path = vec![NO_PREDECESSOR; n_obs];
    path[n_obs - 1] = final_state;
    for o in (1..n_obs).rev() {
        let prev = prev_state[path[o]][o];
        if prev == NO_PREDECESSOR {
            return Err(DecodeError::Infeasible);
        }
        path[o - 1] = prev;
    }

    log::debug!(
        "viterbi found a {}-record path with log-probability {final_logp}",
        n_obs
    );
    Ok(path)
}

/// Emission log-probability of one observation in state `i`.
///
/// `dp <= 0` makes the emission impossible. For the terminal code the
/// likelihood is `ln(dp)` alone; otherwise `sigma > 0` selects the lognormal
/// log-pdf of the bucketised delay and `lambda > 0` the exponential one.
fn emission_logp(hmm: &Hmm, i: usize, k: usize, code: ObsCode, dx: f64) -> f64 {
    let e = hmm.emission(i, k);
    if e.dp <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if code == ObsCode::End {
        return e.dp.ln();
    }
    if e.sigma > 0.0 {
        let z = (dx.ln() - e.mu) / e.sigma;
        e.dp.ln() - (dx * e.sigma * SQRT_2_PI).ln() - 0.5 * z * z
    } else if e.lambda > 0.0 {
        e.dp.ln() + e.lambda.ln() - e.lambda * dx
    } else {
        f64::NEG_INFINITY
    }
}

/// Map a delay onto its log-spaced bucket: `1` for delays of at most two
/// microseconds, `trunc(exp(trunc(ln d)))` otherwise. The truncations are
/// part of the model contract.
pub fn delay_bucket(delay_usec: u64) -> f64 {
    if delay_usec <= 2 {
        return 1.0;
    }
    let ld = (delay_usec as f64).ln();
    let li = ld as i64;
    let ed = (li as f64).exp();
    let ei = ed as i64;
    ei as f64
}

/// Serialise a decoded path as `[[state;code;delay];…]`, refusing output
/// beyond `cap` bytes.
fn encode_path_capped(
    hmm: &Hmm,
    path: &[usize],
    observations: &[Observation],
    cap: usize,
) -> Result<String, DecodeError> {
    // Each entry needs the bracketing and quoting characters, the state
    // name, a one-byte code, and at most 20 digits of delay.
    let per_entry = 30 + hmm.max_state_name_len();
    let mut out = String::with_capacity((path.len() * per_entry).min(cap) + 2);
    out.push('[');
    for (idx, (&state, obs)) in path.iter().zip(observations).enumerate() {
        if idx > 0 {
            out.push(';');
        }
        out.push_str(&format!(
            "[\"{}\";\"{}\";{}]",
            hmm.state_name(state),
            obs.code,
            obs.delay_usec
        ));
        if out.len() > cap {
            return Err(DecodeError::OversizeOutput);
        }
    }
    out.push(']');
    if out.len() > cap {
        return Err(DecodeError::OversizeOutput);
    }
    Ok(out)
}
