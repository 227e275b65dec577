#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "baily")]
#[command(author, version, about = "An ES-module dev server with native HMR", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted logs (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dev server
    Dev {
        /// Port to listen on
        #[arg(long, short)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Public base path
        #[arg(long)]
        base: Option<String>,

        /// Disable hot module replacement
        #[arg(long)]
        no_hmr: bool,

        /// Open the browser once the server is listening
        #[arg(long)]
        open: bool,
    },

    /// Pre-bundle dependencies without starting the server
    Optimize {
        /// Force a fresh optimization even when the cache is current
        #[arg(long)]
        force: bool,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    match cli.command {
        Commands::Dev {
            port,
            host,
            base,
            no_hmr,
            open,
        } => {
            commands::dev::run(commands::dev::DevAction {
                root: cli.root,
                port,
                host,
                base,
                hmr: !no_hmr,
                open,
            })
            .await
        }
        Commands::Optimize { force } => commands::optimize::run(cli.root, force, cli.json),
        Commands::Version => {
            println!("baily {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
