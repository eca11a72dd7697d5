use fogsched::utils;
use fogsched::utils::prelude::*;
use structopt::StructOpt;

mod cli;
mod commands;

fn main() -> Result<()> {
    // panic setup should be done early
    utils::panic::setup();

    let cli = cli::Cli::from_args();

    // the layered config decides how logging looks, so it goes first
    utils::app_config::init(cli.config.as_deref(), cli.preset.as_deref())?;
    let _guard = utils::logging::setup()?;

    trace!("Start cli execution");

    cli.execute().map_err(|err| {
        error!(%err, "fogsched failed");
        err
    })
}
