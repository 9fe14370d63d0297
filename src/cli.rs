//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::installer;
use crate::output::OutputContext;

/// Install and verify a Dragonchain node on Kubernetes
#[derive(Parser)]
#[command(
    name = "dc-installer",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Install a chain (or converge an existing install)
    Install,

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn run(self) -> Result<()> {
        let Cli {
            quiet,
            no_color,
            command,
        } = self;
        match command {
            Command::Version => {
                println!("{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
            Command::Install => {
                let ctx = OutputContext::new(no_color, quiet);
                installer::run(&ctx).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_before_and_after_subcommand() {
        let cli = Cli::try_parse_from(["dc-installer", "--quiet", "install"]).expect("parse");
        assert!(cli.quiet);
        let cli = Cli::try_parse_from(["dc-installer", "install", "--no-color"]).expect("parse");
        assert!(cli.no_color);
    }
}
