#[macro_use]
mod macros;
mod commands;
mod display_bytes;
mod error;
mod opt;
mod table;

use self::commands::execute;
use self::opt::Opt;
use clap::Parser;
use log::debug;

fn main() {
    let opt = Opt::parse();

    env_logger::init();
    debug!("options: {:?}", opt);

    main_unwrap!(execute(&opt));
}
