use clap::Parser;
use std::error::Error;
use std::sync::Arc;

use sensorpic::cli::{self, Args, Command};
use sensorpic::sim::SimulatedDriver;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let result: Result<(), Box<dyn Error>> = match args.command {
        Command::ListDevices => {
            cli::list_devices(Arc::new(SimulatedDriver::new()));
            Ok(())
        }
        Command::Config { action } => {
            cli::handle_config_action(action, args.config.as_deref()).map_err(Into::into)
        }
        Command::Run(run) => cli::run(run, args.config.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
