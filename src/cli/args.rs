use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct MainArgs {
    /// The path to the config file for the relay service
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// The path to a text file containing a list of commands to execute
    #[clap(long, short)]
    pub script: Option<PathBuf>,

    /// Do not read commands from the terminal; only serve the HTTP interface
    #[clap(long)]
    pub headless: bool,
}
