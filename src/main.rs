use clap::Parser;
use tracing_subscriber::EnvFilter;

use im_presence::cli::{Cli, Command, LogFormat, run_config_command, run_demo_command};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Demo { json } => run_demo_command(json).await,
        Command::Config(cmd) => run_config_command(cmd, cli.env_file.as_deref()),
        #[cfg(feature = "postgres")]
        Command::Migrate => {
            let config = im_presence::cli::load_config(cli.env_file.as_deref())?;
            let store = im_presence::offline::postgres::PgOfflineStore::connect(&config.database)?;
            store.migrate().await?;
            println!("Migrations applied");
            Ok(())
        }
    }
}
