use clap::{Parser, Subcommand};
use clap_complete::Shell;
use esrep_cli::commands::{self, backup::BackupCommand};
use esrep_cli::GlobalArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "esbackup",
    version,
    about = "Back up VM disks into ZFS datasets or files and restore them"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Backup(BackupCommand),
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages.
    #[command(name = "man-pages")]
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    esrep_cli::install_pipe_hook();
    let cli = Cli::parse();
    esrep_cli::init_logging(&cli.global);

    match cli.command {
        Commands::Backup(command) => {
            let cancel = esrep_cli::cancel_token();
            let response =
                commands::backup::run(command, cli.global.config.as_deref(), cancel);
            esrep_cli::emit(&response)
        }
        Commands::Completions { shell } => {
            esrep_cli::exit_with(commands::completions::run::<Cli>(shell))
        }
        Commands::ManPages { dir } => esrep_cli::exit_with(commands::man_pages::run::<Cli>(&dir)),
    }
}
