use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use torchexport::cli::Args;
use torchexport::{ExportError, ExportPipeline};

fn run(args: &Args) -> Result<ExitCode> {
    let config = args.to_config().map_err(ExportError::from)?;
    info!(?config, "starting export");

    match ExportPipeline::default().run(&config) {
        Ok(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(stage = e.stage(), "{e}");
            eprintln!("export failed during {}: {e}", e.stage());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("export failed during configuration: {e:#}");
            ExitCode::FAILURE
        }
    }
}
