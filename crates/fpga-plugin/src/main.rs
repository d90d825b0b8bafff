mod config;
mod daemon;
mod inventory;
mod tool;

use anyhow::Result;
use clap::Parser;
use utils::logging;
use utils::version;

use crate::config::Cli;
use crate::config::Commands;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => {
            let _guard = logging::init(daemon_args.log_file.as_deref());
            tracing::info!("Starting fpga-plugin daemon {}", &**version::VERSION);
            daemon::run(daemon_args).await
        }
        command => {
            let _guard = logging::init(None);
            // scanning blocks on the change-set channel
            tokio::task::spawn_blocking(move || run_tool(command)).await?
        }
    }
}

fn run_tool(command: Commands) -> Result<()> {
    match command {
        Commands::Info(args) => tool::info(args),
        Commands::Install(args) => tool::install(args),
        Commands::Pr(args) => tool::pr(args),
        Commands::Fpgainfo(args) => tool::fpgainfo(args),
        Commands::List(args) => tool::list(args),
        Commands::Daemon(_) => anyhow::bail!("daemon is not a one-shot command"),
    }
}
