use std::str::FromStr;

use anyhow::Result;

use crate::{
    cmd::{Args, LogLevel},
    init::logger,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn init() -> Result<Args> {
    let (mut args, _remainder) = Args::parse()?;
    logger::init(
        &args.log_level.take().unwrap_or(LogLevel::from_str("error")?),
        args.colored.unwrap_or(false),
    )?;
    log::debug!("{:?}", _remainder);

    if args.help.is_some_and(|h| h) {
        println!("fproxy v{VERSION}\r");
        Args::print_help();
        std::process::exit(0);
    }

    Ok(args)
}
