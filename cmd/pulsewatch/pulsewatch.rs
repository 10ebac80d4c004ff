use clap::Parser;
use pulsewatch::{cli::CLI, initializers::init_tracing};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();

    init_tracing(&opts);

    command.run(&opts).await
}
