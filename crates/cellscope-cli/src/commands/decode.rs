//! `cellscope decode`: run the Viterbi decoder over a recorded trace.
//!
//! Trace files carry one observation per line as `<delay_us> <code>`, with
//! `#` starting a comment. The terminal record is appended automatically if
//! the trace does not end with one.

use std::path::Path;

use cellscope_core::{ObsCode, Observation, decode_path};

use super::{load_model, select_track};

pub fn run(model_path: &Path, trace_path: &Path, track: &str) -> Result<(), String> {
    let pair = load_model(model_path)?;
    let hmm = select_track(&pair, track)?;
    let observations = read_trace(trace_path)?;

    match decode_path(hmm, &observations) {
        Ok(path) => println!("{path}"),
        Err(err) => {
            log::warn!("decode failed: {err}");
            println!("[]");
        }
    }
    Ok(())
}

pub fn read_trace(path: &Path) -> Result<Vec<Observation>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;

    let mut observations = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let bad = |what: &str| format!("{}:{}: {what}", path.display(), lineno + 1);
        let delay = parts
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| bad("expected a non-negative delay in microseconds"))?;
        let code = parts
            .next()
            .and_then(ObsCode::from_str)
            .ok_or_else(|| bad("expected an observation code (+ - $ F)"))?;
        if parts.next().is_some() {
            return Err(bad("trailing fields"));
        }
        observations.push(Observation::new(delay, code));
    }

    if observations.last().map(|o| o.code) != Some(ObsCode::End) {
        observations.push(Observation::new(0, ObsCode::End));
    }
    Ok(observations)
}
