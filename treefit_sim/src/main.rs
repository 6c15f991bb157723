//! Fit validation CLI
//!
//! Run deterministic fit scenarios against generated events.

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use treefit_sim::{ScenarioId, ScenarioRunner, SimError, SimExport};

/// Deterministic fit validation CLI
#[derive(Parser, Debug)]
#[command(name = "treefit-sim")]
#[command(about = "Run deterministic validation fits for treefit", long_about = None)]
struct Args {
    /// Master seed for determinism
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (single_vertex, cascade, straight_tracks, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Events to generate and fit per scenario
    #[arg(short, long, default_value = "100")]
    events: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON summary output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-event fit records to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn run(args: &Args) -> Result<bool, SimError> {
    let scenarios = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![ScenarioId::parse(&args.scenario)
            .ok_or_else(|| SimError::UnknownScenario(args.scenario.clone()))?]
    };

    let runner = ScenarioRunner::new(args.seed, args.events);
    let mut all_passed = true;

    for scenario in scenarios {
        let result = runner.run(scenario)?;
        all_passed &= result.passed;

        let export = SimExport::from_result(&result);
        if args.json {
            println!("{}", serde_json::to_string(&export)?);
        } else {
            info!(
                "{}: {} | {}/{} converged | vertex RMSE {:.4} cm | chi2/ndf {:.2} | mean |pull| {:.2}",
                scenario.name(),
                if result.passed { "PASS" } else { "FAIL" },
                result.n_converged,
                result.n_events,
                result.vertex_rmse,
                result.mean_chi2_per_ndf,
                result.mean_abs_pull,
            );
        }
        if let Some(path) = &args.export {
            let path = if args.scenario == "all" {
                format!("{}.{}.json", path, scenario.name())
            } else {
                path.clone()
            };
            export.write_to_file(&path)?;
            info!("exported {} events to {}", result.n_events, path);
        }
    }
    Ok(all_passed)
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("run failed: {}", e);
            std::process::exit(2);
        }
    }
}
