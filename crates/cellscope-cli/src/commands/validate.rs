//! `cellscope validate`: parse a model file and report its structure.

use std::path::Path;

use cellscope_core::Hmm;

use super::load_model;

pub fn run(model_path: &Path, emit: bool) -> Result<(), String> {
    let pair = load_model(model_path)?;

    if pair.is_empty() {
        println!("{}: valid, but carries no models", model_path.display());
        return Ok(());
    }

    if let Some(hmm) = &pair.packets {
        print_summary("packet model", hmm);
    }
    if let Some(hmm) = &pair.streams {
        print_summary("stream model", hmm);
    }

    if emit {
        println!("{}", pair.to_wire_string());
    }
    Ok(())
}

fn print_summary(label: &str, hmm: &Hmm) {
    println!(
        "{label}: {} states, alphabet [{}]",
        hmm.num_states(),
        hmm.obs_space().join(" ")
    );
    for (i, name) in hmm.states().iter().enumerate() {
        let outgoing = (0..hmm.num_states())
            .filter(|&j| hmm.trans_prob(i, j) > 0.0)
            .count();
        let emitting = (0..hmm.num_obs())
            .filter(|&k| hmm.emission(i, k).dp > 0.0)
            .count();
        println!(
            "  {name:<24} start {:<10} transitions {outgoing:<3} emissions {emitting}",
            hmm.start_prob(i),
        );
    }
}
