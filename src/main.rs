// hred: hierarchical recurrent encoder-decoder for query/session prediction.
// Uses the Burn deep learning framework.
//
// Usage:
//   cargo run -- train [config.json]   # Train on random session batches
//   cargo run -- summary               # Show presets and parameter counts

use std::env;

use anyhow::Context;
use hred::config::TrainingConfig;
use hred::training;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "train" => {
            let cfg = match args.get(2) {
                Some(path) => TrainingConfig::load(path).with_context(|| format!("loading {}", path))?,
                None => TrainingConfig::default(),
            };
            println!("=== Training HRED ===");
            let summary = training::train_model(&cfg)?;
            if let Some(loss) = summary.final_loss() {
                println!("Final loss: {:.4} ({:.1}s)", loss, summary.elapsed_secs);
            }
        }
        "summary" => {
            println!("=== Configurations ===\n");
            for (name, params, cfg) in training::describe_configurations() {
                println!(
                    "  {:<40} params: {:>12}  lr: {}  batch: {}  max_length: {}",
                    name, params, cfg.optimizer.initial_learning_rate, cfg.batch_size, cfg.max_length
                );
            }
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    println!("hred: hierarchical recurrent encoder-decoder for session modeling");
    println!();
    println!("USAGE:");
    println!("  cargo run -- train [config.json]   Train on random session batches");
    println!("  cargo run -- summary               Show presets and parameter counts");
    println!();
    println!("Set RUST_LOG=debug to see per-step optimizer details.");
}
