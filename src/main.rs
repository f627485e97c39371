//! Caravel - cluster backup and disaster recovery for Kubernetes

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caravel::api;

/// Caravel - cluster backup and disaster recovery for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "caravel", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// The level at which to log
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Caravel server (default mode)
    Server(ServerArgs),

    /// Run the node agent for pod volume backups and restores
    Agent(AgentArgs),

    /// Restic repository operations
    Repo(RepoArgs),
}

/// Server mode arguments
#[derive(Parser, Debug)]
struct ServerArgs {
    /// Namespace holding Caravel resources
    #[arg(long, default_value = caravel::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Directory containing Caravel plugins
    #[arg(long, default_value = caravel::DEFAULT_PLUGIN_DIR)]
    plugin_dir: std::path::PathBuf,
}

/// Agent mode arguments
#[derive(Parser, Debug)]
struct AgentArgs {
    /// Namespace holding Caravel resources
    #[arg(long, default_value = caravel::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
}

/// Repository arguments
#[derive(Parser, Debug)]
struct RepoArgs {
    #[command(subcommand)]
    command: RepoCommands,
}

#[derive(Subcommand, Debug)]
enum RepoCommands {
    /// Initialize the restic repository for a namespace
    Init(RepoOpArgs),

    /// Verify a namespace's repository
    Check(RepoOpArgs),

    /// Drop unreferenced data from a namespace's repository
    Prune(RepoOpArgs),
}

/// Arguments shared by the repository subcommands
#[derive(Parser, Debug)]
struct RepoOpArgs {
    /// Namespace whose repository to operate on
    repo_namespace: String,

    /// Namespace holding Caravel resources
    #[arg(long, default_value = caravel::DEFAULT_NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    if cli.crd {
        for crd in api::all_crds() {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    match cli.command {
        Some(Commands::Agent(args)) => {
            caravel::server::run_agent(args.namespace, args.node_name).await?
        }
        Some(Commands::Server(args)) => {
            caravel::server::run_server(args.namespace, args.plugin_dir).await?
        }
        Some(Commands::Repo(args)) => {
            use caravel::server::RepoOp;
            let (op, args) = match args.command {
                RepoCommands::Init(args) => (RepoOp::Init, args),
                RepoCommands::Check(args) => (RepoOp::Check, args),
                RepoCommands::Prune(args) => (RepoOp::Prune, args),
            };
            caravel::server::run_repo_op(args.namespace, args.repo_namespace, op).await?
        }
        None => {
            caravel::server::run_server(
                caravel::DEFAULT_NAMESPACE.to_string(),
                caravel::DEFAULT_PLUGIN_DIR.into(),
            )
            .await?
        }
    }

    Ok(())
}
