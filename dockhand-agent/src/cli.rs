use crate::config::Config;
use crate::local::{self, LocalDeployment};
use crate::util::logging::init_tracing_stdout;
use crate::agent;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(version, about = "Host-resident deployment agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent management commands
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Run a one-shot deployment from a local or remote bundle
    Local(LocalArgs),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Run the agent daemon
    Run {
        /// Path to the agent configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Install the agent as a system service
    Install {
        /// Path to the agent configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Uninstall the agent service
    Uninstall,

    /// Check agent status
    Status,
}

#[derive(clap::Args)]
struct LocalArgs {
    /// Bundle source: a local file or directory, or s3://bucket/key
    #[arg(short = 'l', long)]
    bundle_location: String,

    /// Bundle packaging: tar, tgz, zip or directory
    #[arg(short = 't', long, default_value = "tar")]
    bundle_type: String,

    /// What to do when a destination file already exists
    #[arg(short = 'b', long, default_value = "DISALLOW")]
    file_exists_behavior: String,

    /// Deployment group identifier
    #[arg(short = 'g', long, default_value = "default-local-group")]
    deployment_group: String,

    /// Deployment group display name
    #[arg(long, default_value = "LocalFleet")]
    group_name: String,

    /// Application name
    #[arg(short = 'a', long, default_value = "LocalApp")]
    application_name: String,

    /// Lifecycle events to run, in order
    #[arg(short = 'e', long, value_delimiter = ',')]
    events: Vec<String>,

    /// Appspec filename inside the bundle
    #[arg(long)]
    appspec: Option<String>,

    /// Path to the agent configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

pub async fn cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(cmd) => match cmd {
            // the daemon wires its own rotating-file tracing
            AgentCommands::Run { config } => agent::run(config).await?,
            AgentCommands::Install { config } => {
                init_tracing_stdout();
                agent::install_service(config.as_deref()).await?
            }
            AgentCommands::Uninstall => {
                init_tracing_stdout();
                agent::uninstall_service().await?
            }
            AgentCommands::Status => {
                init_tracing_stdout();
                agent::status_service().await?
            }
        },
        Commands::Local(args) => {
            init_tracing_stdout();
            let config = Config::load(args.config.as_deref())?;
            local::run(
                config,
                LocalDeployment {
                    bundle_location: args.bundle_location,
                    bundle_type: args.bundle_type,
                    file_exists_behavior: args.file_exists_behavior,
                    deployment_group_id: args.deployment_group,
                    deployment_group_name: args.group_name,
                    application_name: args.application_name,
                    events: args.events,
                    appspec_filename: args.appspec,
                },
            )
            .await?
        }
        Commands::Version => {
            println!("dockhand version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
