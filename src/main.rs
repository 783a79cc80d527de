use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(
    name = "taskmesh",
    version,
    about = "Mesh/task shader lowering: LDS layout, task ring and export stage"
)]
struct Cli {
    /// Log lowering decisions to stderr (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the LDS layout planned for a pipeline's mesh shader
    Layout {
        /// Pipeline configuration (JSON)
        config: PathBuf,
    },
    /// Lower the reference task/mesh pair of one or more pipelines
    Lower {
        /// Pipeline configurations (JSON)
        #[arg(required = true)]
        configs: Vec<PathBuf>,
        /// Print the lowered module
        #[arg(long)]
        print: bool,
        /// Print the blake3 fingerprint of the lowered module
        #[arg(long)]
        hash: bool,
        /// Run a dispatch of X,Y,Z workgroups on the reference executor
        #[arg(long, value_name = "X,Y,Z", value_parser = cli::parse_dims)]
        run: Option<[u32; 3]>,
    },
}

fn main() {
    let cli = Cli::parse();
    cli::init_logger(cli.verbose);

    match cli.command {
        Command::Layout { config } => cli::layout::cmd_layout(config),
        Command::Lower {
            configs,
            print,
            hash,
            run,
        } => cli::lower::cmd_lower(configs, print, hash, run),
    }
}
