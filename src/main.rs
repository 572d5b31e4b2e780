use clap::Parser as _;
use mtec_mqtt::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Run(commands::run::Args),
    Registers(commands::registers::Args),
    Read(commands::read::Args),
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
    let filter_description = std::env::var("MTEC_MQTT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("warning: ignoring MTEC_MQTT_LOG: {e}");
            tracing_subscriber::filter::targets::Targets::new()
                .with_default(tracing::level_filters::LevelFilter::INFO)
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    let command = Commands::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return end(Err(e)),
    };
    match command {
        Commands::Run(args) => end(runtime.block_on(commands::run::run(args))),
        Commands::Registers(args) => end(runtime.block_on(commands::registers::run(args))),
        Commands::Read(args) => end(runtime.block_on(commands::read::run(args))),
    }
}
