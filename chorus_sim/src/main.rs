//! Chorus Dispatch Simulator CLI
//!
//! Run deterministic dispatch scenarios against scripted providers.

use chorus_core::ChorusConfig;
use chorus_sim::scenarios::ScenarioId;
use chorus_sim::{ScenarioResult, ScenarioRunner};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Chorus Dispatch Simulation CLI
#[derive(Parser, Debug)]
#[command(name = "chorus-sim")]
#[command(about = "Run deterministic simulation scenarios for Chorus dispatch", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (partition, priority_order, provider_cap, store_outage, ..., all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Run only the chaos scenarios
    #[arg(long)]
    chaos: bool,

    /// Number of random seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Work items per scenario
    #[arg(short, long, default_value = "20")]
    items: usize,

    /// JSON file with a ChorusConfig (run, rate_limits, retry, ...)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export run data of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn init_logging(verbose: bool) {
    let builder = FmtSubscriber::builder();
    let result = if verbose {
        tracing::subscriber::set_global_default(builder.with_max_level(Level::DEBUG).finish())
    } else {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())
    };
    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if !args.json {
        info!("Chorus Dispatch Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let config = match &args.config {
        Some(path) => ChorusConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }),
        None => ChorusConfig::default(),
    };
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.chaos {
        ScenarioId::chaos()
    } else if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(1);
        })]
    };

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        info!("Running with export to: {}", export_path);
        let result = ScenarioRunner::new(base_seed)
            .with_items(args.items)
            .with_config(config)
            .with_export(true)
            .run(scenarios[0])
            .await;

        if let Some(export) = &result.export {
            match export.write_to_file(export_path) {
                Ok(()) => info!("Exported {} runs to {}", export.runs.len(), export_path),
                Err(e) => error!("Failed to write export: {}", e),
            }
        }

        if result.passed {
            info!("✓ {} (seed={}) PASSED - exported to {}", scenarios[0].name(), base_seed, export_path);
        } else {
            error!(
                "✗ {} FAILED: {}",
                scenarios[0].name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_items(args.items)
            .with_config(config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }

            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "virtual_secs": r.virtual_secs,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
