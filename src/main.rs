use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Plan and execute gantry moves
#[derive(Parser, Debug)]
#[command(name = "gantry-motion")]
#[command(version)]
#[command(about = "Trajectory planning and move execution for the gantry bus")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan a request and print the move groups as JSON
    Plan {
        /// Plan request file (JSON)
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,
    },
    /// Plan a request, execute it and print the final positions as JSON
    Run {
        /// Plan request file (JSON)
        #[arg(short, long, value_name = "FILE")]
        request: PathBuf,

        /// Runtime configuration (JSON); defaults to the simulated loopback bus
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug); logs go to stderr so stdout stays JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match &args.command {
        Command::Plan { request } => gantry_motion::runtime::plan_file(request),
        Command::Run { request, config } => gantry_motion::runtime::run(request, config.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
