use clap::Parser;

fn main() -> eyre::Result<()> {
    let _guard = env_tracing_logger::init();
    let cli = robocal::cli::Cli::parse();
    robocal::cli::run(cli)
}
