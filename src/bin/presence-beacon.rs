use clap::Parser;
use log::{error, info};
use presence_beacon::{init_logging, run, Args};
use presence_beacon::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(args.verbose);
    info!(concat!("Presence Beacon ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            Ok(())
        },
        Err(err) => {
            error!("Fatal error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
