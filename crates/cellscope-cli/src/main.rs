//! CLI for cellscope, the traffic-model telemetry engine for anonymity relays.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cellscope")]
#[command(about = "cellscope: validate, decode, and simulate relay traffic models")]
#[command(version = cellscope_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a model file and report its structure
    Validate {
        /// Model file: a control blob (TRUE/FALSE form) or a bare object
        model: PathBuf,

        /// Re-serialise the parsed model to stdout (round-trip check)
        #[arg(long)]
        emit: bool,
    },

    /// Decode a recorded observation trace against a model
    Decode {
        /// Model file: a control blob or a bare object
        model: PathBuf,

        /// Trace file: one `<delay_us> <code>` record per line
        trace: PathBuf,

        /// Which model the trace decodes against
        #[arg(long, default_value = "packets", value_parser = ["packets", "streams"])]
        track: String,
    },

    /// Sample a synthetic trace from a model and decode it back
    Simulate {
        /// Model file: a control blob or a bare object
        model: PathBuf,

        /// Which model to sample from
        #[arg(long, default_value = "packets", value_parser = ["packets", "streams"])]
        track: String,

        /// Number of non-terminal observations to sample
        #[arg(long, default_value_t = 20)]
        count: usize,

        /// RNG seed for a reproducible trace
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Validate { model, emit } => commands::validate::run(&model, emit),
        Commands::Decode {
            model,
            trace,
            track,
        } => commands::decode::run(&model, &trace, &track),
        Commands::Simulate {
            model,
            track,
            count,
            seed,
        } => commands::simulate::run(&model, &track, count, seed),
    };

    if let Err(message) = outcome {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
