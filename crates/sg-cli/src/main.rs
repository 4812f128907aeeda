use anyhow::Result;
use clap::{Parser, Subcommand};

const CLI_NAME: &str = "sg-cli";

#[derive(Parser)]
#[command(name = "sg", version, about = "Sequence archive service CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the archive API with its build worker and reaper.
    Serve,
    Migrate,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Re-offer stale BUILDING archives once and build them in this process.
    Reap,
    /// Request an archive of the whole index and build it in this process.
    BuildAll,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            let config = sg_archive::load_config()?;
            sg_archive::run(config).await?;
        }
        Commands::Migrate => {
            sg_core::logging::init(CLI_NAME);
            let pool = sg_core::db::connect(&sg_core::db::DbSettings::from_env(2)?).await?;
            let version = sg_core::migrations::run(&pool).await?;
            tracing::info!(schema_version = version, "migrations applied");
        }
        Commands::Config { command } => {
            sg_core::logging::init(CLI_NAME);
            let pool = sg_core::db::connect(&sg_core::db::DbSettings::from_env(2)?).await?;
            match command {
                ConfigCommand::Seed => {
                    let seeded = sg_core::service_config::seed_service_config(
                        &pool,
                        sg_archive::CONFIG_SERVICE,
                        sg_archive::config::default_config_json(),
                    )
                    .await?;
                    if seeded {
                        tracing::info!(service = sg_archive::CONFIG_SERVICE, "service config seeded");
                    } else {
                        tracing::info!("service config already present");
                    }
                }
            }
        }
        Commands::Reap => {
            let config = sg_archive::load_config()?;
            sg_archive::run_job(config, sg_archive::Job::Reap).await?;
        }
        Commands::BuildAll => {
            let config = sg_archive::load_config()?;
            sg_archive::run_job(config, sg_archive::Job::BuildAll).await?;
        }
    }

    Ok(())
}
