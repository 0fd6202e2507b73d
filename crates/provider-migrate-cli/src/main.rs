use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = provider_migrate_cli::Cli::parse();
    provider_migrate_cli::init_tracing(cli.verbose)?;
    provider_migrate_cli::run_cli(cli)
}
