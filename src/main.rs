use board_rtu_tools::commands;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_FILTER_VAR: &str = "BOARD_RTU_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers_list::Args),
    Read(commands::read::Args),
    Pressure(commands::pressure::Args),
    Write(commands::write::Args),
    AnalogMode(commands::analog_mode::Args),
    RawRead(commands::raw_read::Args),
    RawWrite(commands::raw_write::Args),
    #[command(subcommand)]
    Redfish(commands::redfish::Commands),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_FILTER_VAR).unwrap_or_else(|_| "warn".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_FILTER_VAR} is not a valid log filter");
            eprintln!("  because: {e}");
            std::process::exit(2);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers_list::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Pressure(args) => end(commands::pressure::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
        Commands::AnalogMode(args) => end(commands::analog_mode::run(args)),
        Commands::RawRead(args) => end(commands::raw_read::run(args)),
        Commands::RawWrite(args) => end(commands::raw_write::run(args)),
        Commands::Redfish(command) => end(commands::redfish::run(command)),
    }
}
