use std::path::PathBuf;

use structopt::clap::AppSettings;
use structopt::StructOpt;

use crate::commands::{self, Cmd};
use fogsched::utils::prelude::*;

#[derive(StructOpt)]
#[structopt(
    about,
    setting = AppSettings::ArgRequiredElseHelp,
    global_setting = AppSettings::VersionlessSubcommands
)]
pub struct Cli {
    /// Set a custom config file
    #[structopt(short, long, parse(from_os_str), value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Apply the named table under `presets` on top of the config
    #[structopt(short, long, value_name = "NAME")]
    pub preset: Option<String>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    Run(commands::Run),
    Config(commands::Config),
    Validate(commands::Validate),
}

impl Cli {
    /// Match commands
    pub fn execute(self) -> Result<()> {
        match self.cmd {
            Command::Run(cmd) => cmd.run(),
            Command::Config(cmd) => cmd.run(),
            Command::Validate(cmd) => cmd.run(),
        }
    }
}
