mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands};
use dotenv::dotenv;
use progress::CliReporter;
use simpair_core::engine::{ComparisonSummary, ExtractionSummary};
use simpair_core::{AppConfig, Engine, GradientGridExtractor};
use tracing::{error, info, warn};

/// Exit status for settings rejected before any work starts.
const EXIT_CONFIGURATION: i32 = 2;

fn main() {
    dotenv().ok();
    let args = Cli::parse();

    // Rejected settings exit before the log file is created.
    let config = match effective_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red(), err);
            process::exit(exit_code(&err));
        }
    };

    let code = {
        let _guard = logging::init_logger();
        match run(args, config) {
            Ok(()) => 0,
            Err(err) => {
                error!("Error: {:#}", err);
                exit_code(&err)
            }
        }
    };

    process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<simpair_core::Error>() {
        Some(simpair_core::Error::Configuration(_)) | Some(simpair_core::Error::Config(_)) => {
            EXIT_CONFIGURATION
        }
        _ => 1,
    }
}

fn run(args: Cli, config: AppConfig) -> anyhow::Result<()> {
    let command = match args.command {
        Some(command) => command,
        None => {
            Cli::command().print_long_help()?;
            return Ok(());
        }
    };

    if let Commands::PrintConfig = command {
        let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
        println!("{}", rendered);
        return Ok(());
    }

    let engine = Engine::new(config, Box::new(GradientGridExtractor::new()))?;
    if let Some(secs) = args.budget_secs {
        start_budget_timer(&engine, secs);
    }
    let reporter = CliReporter::new();

    match command {
        Commands::Run => {
            let summary = engine.run_all(&reporter)?;
            print_extraction(&summary.extraction);
            if let Some(comparison) = &summary.comparison {
                print_comparison(comparison);
            }
        }
        Commands::Extract => {
            let (_, summary) = engine.read_images(&reporter)?;
            print_extraction(&summary);
        }
        Commands::Compare => {
            let (catalog, extraction) = engine.read_images(&reporter)?;
            if extraction.drained {
                print_extraction(&extraction);
                return Ok(());
            }
            let summary = engine.compare_images(&catalog, &reporter)?;
            print_comparison(&summary);
        }
        Commands::Export => {
            let summary = engine.export()?;
            info!(
                "{} rows written to {} and {}",
                format!("{}", summary.rows).green(),
                summary.csv_path.display(),
                summary.json_path.display()
            );
        }
        Commands::Status => {
            let status = engine.status()?;
            match status.catalog_items {
                Some(items) => info!(
                    "Catalog: {} images, {} unreadable, extraction {}",
                    format!("{}", items).cyan(),
                    format!("{}", status.quarantined).yellow(),
                    if status.extraction_complete {
                        "complete".green()
                    } else {
                        "incomplete".yellow()
                    }
                ),
                None => info!("Catalog: {}", "no checkpoint".dimmed()),
            }
            match status.queue_remaining {
                Some(remaining) => info!("Queue: {} pairs remaining", format!("{}", remaining).cyan()),
                None => info!("Queue: {}", "no checkpoint".dimmed()),
            }
            info!(
                "Results: {} compared, {} failed",
                format!("{}", status.results).green(),
                format!("{}", status.failures).red()
            );
        }
        Commands::ClearCache => {
            match prompt_confirm("Are you SURE you want to delete every checkpoint?", Some(false)) {
                Ok(true) => {
                    let removed = engine.clear_checkpoints()?;
                    println!("{} checkpoints removed", removed);
                }
                _ => return Ok(()),
            }
        }
        Commands::PrintConfig => {}
    }

    Ok(())
}

fn effective_config(args: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = simpair_core::config::load_configuration().map_err(simpair_core::Error::from)?;
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    config.validate()?;
    Ok(config)
}

fn start_budget_timer(engine: &Engine, secs: u64) {
    let stop = engine.stop_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(secs));
        warn!("Time budget of {}s used up; finishing running work and checkpointing", secs);
        stop.request_stop();
    });
}

fn print_extraction(summary: &ExtractionSummary) {
    println!();
    info!(
        "Catalog: {} images ({}), {} extracted, {} unreadable in {}",
        format!("{}", summary.items).cyan(),
        if summary.from_checkpoint { "resumed" } else { "scanned" },
        format!("{}", summary.extracted).green(),
        format!("{}", summary.unreadable).yellow(),
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
    );
    if summary.drained {
        warn!("Extraction stopped early; run again to continue");
    }
}

fn print_comparison(summary: &ComparisonSummary) {
    info!(
        "Compared {} of {} pairs on {} ({} failed) in {}",
        format!("{}", summary.compared).green(),
        format!("{}", summary.scheduled).cyan(),
        summary.backend,
        format!("{}", summary.failed).red(),
        format!("{:.2}s", summary.duration.as_secs_f64()).green(),
    );
    if summary.exported {
        info!("{} results exported", format!("{}", summary.results_total).green());
    } else {
        warn!(
            "{} pairs still queued; run again to continue",
            format!("{}", summary.remaining).yellow()
        );
    }
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_pool_exits_as_configuration_error() {
        let args = Cli::parse_from(["simpair", "--workers", "100000", "status"]);
        let err = effective_config(&args).unwrap_err();
        assert_eq!(exit_code(&err), EXIT_CONFIGURATION);
    }

    #[test]
    fn test_overrides_are_applied() {
        let args = Cli::parse_from([
            "simpair", "--root", "/photos", "--workers", "1", "--backend", "accelerator", "run",
        ]);
        let config = effective_config(&args).unwrap();
        assert_eq!(config.root, "/photos");
        assert_eq!(config.workers, 1);
        assert_eq!(config.backend, simpair_core::BackendKind::Accelerator);
    }
}
