use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "nestconf")]
#[command(about = "nestconf CLI - migrate and administer configuration stores")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy every namespace from one backend to another
    Migrate {
        /// Storage config (TOML) of the source backend
        #[arg(long)]
        from: PathBuf,

        /// Storage config (TOML) of the destination backend
        #[arg(long)]
        to: PathBuf,

        /// JSON file mapping namespace -> {custom group: arity}
        #[arg(long, env = "NESTCONF_CUSTOM_GROUPS")]
        custom_groups: Option<PathBuf>,
    },

    /// List stored (namespace, instance) pairs
    List {
        /// Storage config (TOML)
        #[arg(short, long, env = "NESTCONF_CONFIG")]
        config: PathBuf,
    },

    /// Dump one namespace instance as JSON
    Export {
        /// Storage config (TOML)
        #[arg(short, long, env = "NESTCONF_CONFIG")]
        config: PathBuf,

        /// Namespace to export
        #[arg(short, long)]
        namespace: String,

        /// Instance id
        #[arg(short, long, default_value = "0")]
        instance: String,

        /// JSON file mapping namespace -> {custom group: arity}
        #[arg(long, env = "NESTCONF_CUSTOM_GROUPS")]
        custom_groups: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete everything a backend stores
    DeleteAll {
        /// Storage config (TOML)
        #[arg(short, long, env = "NESTCONF_CONFIG")]
        config: PathBuf,

        /// Drop the whole database or data directory
        #[arg(long)]
        drop_target: bool,

        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate {
            from,
            to,
            custom_groups,
        } => {
            commands::run_migrate(&from, &to, custom_groups.as_deref()).await?;
        }
        Commands::List { config } => {
            commands::run_list(&config).await?;
        }
        Commands::Export {
            config,
            namespace,
            instance,
            custom_groups,
            output,
        } => {
            commands::run_export(
                &config,
                &namespace,
                &instance,
                custom_groups.as_deref(),
                output.as_deref(),
            )
            .await?;
        }
        Commands::DeleteAll {
            config,
            drop_target,
            yes,
        } => {
            commands::run_delete_all(&config, drop_target, yes).await?;
        }
    }

    Ok(())
}
