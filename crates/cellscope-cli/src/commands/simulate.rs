//! `cellscope simulate`: sample a synthetic trace from a model, then decode
//! it back.
//!
//! Sampling walks the chain: pick a start state from the start probabilities,
//! emit a non-terminal code and a delay drawn from that state's emission
//! distribution, then follow a sampled transition. The walk stops after
//! `count` observations or when a state has no outgoing transitions. The
//! decoded path printed afterwards shows how well the model recovers its own
//! trace.

use std::f64::consts::PI;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cellscope_core::{Hmm, ObsCode, Observation, decode_path};

use super::{load_model, select_track};

pub fn run(
    model_path: &Path,
    track: &str,
    count: usize,
    seed: Option<u64>,
) -> Result<(), String> {
    let pair = load_model(model_path)?;
    let hmm = select_track(&pair, track)?;

    let seed = seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    println!("# seed {seed}");

    let observations = sample_trace(hmm, count, &mut rng)?;
    for obs in &observations {
        println!("{} {}", obs.delay_usec, obs.code);
    }

    match decode_path(hmm, &observations) {
        Ok(path) => println!("{path}"),
        Err(err) => {
            log::warn!("decode of the sampled trace failed: {err}");
            println!("[]");
        }
    }
    Ok(())
}

fn sample_trace(hmm: &Hmm, count: usize, rng: &mut StdRng) -> Result<Vec<Observation>, String> {
    let n = hmm.num_states();
    let start_weights: Vec<f64> = (0..n).map(|i| hmm.start_prob(i)).collect();
    let mut state = pick_weighted(&start_weights, rng)
        .ok_or("the model has no positive start probabilities")?;

    let mut observations = Vec::with_capacity(count + 1);
    while observations.len() < count {
        if let Some((code, delay)) = sample_emission(hmm, state, rng) {
            observations.push(Observation::new(delay, code));
        }
        let row: Vec<f64> = (0..n).map(|j| hmm.trans_prob(state, j)).collect();
        let Some(next) = pick_weighted(&row, rng) else {
            break; // absorbing state
        };
        state = next;
    }
    observations.push(Observation::new(0, ObsCode::End));
    Ok(observations)
}

/// Draw one non-terminal emission from the state's per-code masses, with a
/// delay from the selected code's distribution.
fn sample_emission(hmm: &Hmm, state: usize, rng: &mut StdRng) -> Option<(ObsCode, u64)> {
    let codes: Vec<ObsCode> = hmm
        .obs_space()
        .iter()
        .filter_map(|c| ObsCode::from_str(c))
        .filter(|c| *c != ObsCode::End)
        .collect();
    let weights: Vec<f64> = codes
        .iter()
        .map(|c| {
            hmm.obs_code_index(*c)
                .map(|k| hmm.emission(state, k).dp)
                .unwrap_or(0.0)
        })
        .collect();
    let chosen = pick_weighted(&weights, rng)?;
    let code = codes[chosen];
    let k = hmm.obs_code_index(code)?;
    let e = hmm.emission(state, k);

    let delay = if e.sigma > 0.0 {
        // Lognormal via a Box-Muller normal variate.
        let u1: f64 = 1.0 - rng.random::<f64>();
        let u2: f64 = rng.random();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
        (e.mu + e.sigma * z).exp()
    } else if e.lambda > 0.0 {
        let u: f64 = 1.0 - rng.random::<f64>();
        -u.ln() / e.lambda
    } else {
        return None;
    };
    Some((code, delay.round().clamp(0.0, u64::MAX as f64) as u64))
}

/// Sample an index proportionally to non-negative weights. `None` when the
/// weights sum to zero.
fn pick_weighted(weights: &[f64], rng: &mut StdRng) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return None;
    }
    let mut remaining = rng.random::<f64>() * total;
    for (idx, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        remaining -= *w;
        if remaining <= 0.0 {
            return Some(idx);
        }
    }
    weights.iter().rposition(|w| *w > 0.0)
}
