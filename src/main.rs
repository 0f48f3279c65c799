use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use upatch_diff::cli::Args;
use upatch_diff::orchestrator::{self, Outcome};

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_tracing().to_string())),
        )
        .with_target(false)
        .init();

    if let Err(e) = args.validate() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let level = args.log_level();
    let config = upatch_diff::config::Config::default();
    let inputs = args.into_inputs();
    let ctx = orchestrator::build_context(level, &inputs);

    match orchestrator::run(&ctx, &config, &inputs) {
        Ok(Outcome::Written(path)) => {
            println!("wrote {}", path.display());
            ExitCode::SUCCESS
        }
        Ok(Outcome::NoFunctionalChange) => {
            println!("no functional changes; nothing written");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
