//! Stackwright CLI: typed AWS stacks synthesized to CloudFormation.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stackwright",
    version,
    about = "Typed AWS stack composition: VPC, ALB, EC2/Fargate and CodePipeline, synthesized to CloudFormation"
)]
struct Cli {
    #[command(subcommand)]
    command: stackwright::cli::Commands,
}

fn main() {
    let filter = EnvFilter::try_from_env("STACKWRIGHT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = stackwright::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
