use structopt::StructOpt;

use fogsched::utils::prelude::*;

/// Should be implemented by individual subcommand
pub trait Cmd {
    fn run(self) -> Result<()>;
}

/// Show the effective configuration
#[derive(StructOpt)]
pub struct Config {}

impl Cmd for Config {
    fn run(self) -> Result<()> {
        let config: serde_yaml::Value = config().fetch()?;
        print!("{}", serde_yaml::to_string(&config)?);

        Ok(())
    }
}

/// Run every episode of the sweep against the decision service
#[derive(StructOpt)]
pub struct Run {}

impl Cmd for Run {
    fn run(self) -> Result<()> {
        fogsched::run_sim()
    }
}

/// Load every dataset and topology of the sweep without running anything
#[derive(StructOpt)]
pub struct Validate {}

impl Cmd for Validate {
    fn run(self) -> Result<()> {
        let overviews = fogsched::validate()?;
        info!(setups = overviews.len(), "configuration is valid");
        for overview in overviews {
            println!("{}", overview);
        }

        Ok(())
    }
}
