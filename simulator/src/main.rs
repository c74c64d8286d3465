//! Simulate an InfiniBand subnet and administer it from the terminal.
//!
//! The fabric is described by a YAML topology file. Once it is built, every node
//! answers subnet management, performance management and vendor-specific queries, and
//! commands read from stdin can link, unlink and reconfigure it while traffic flows.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin ibsim -- --topology fabric.yaml --workers 8 --delay-avg 100
//! ```
//!
//! Type `help` at the prompt for the list of commands.

use clap::{value_parser, Arg, ArgAction, Command};
use ibsim_fabric::{
    console::{Console, Outcome},
    simulator::{Config, Simulator, Source},
    Error,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt};

fn main() -> ExitCode {
    // Parse arguments
    let matches = Command::new("ibsim")
        .about("simulate the management plane of an InfiniBand subnet")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("topology")
                .long("topology")
                .short('t')
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("YAML file describing nodes and links"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .short('w')
                .default_value("5")
                .value_parser(value_parser!(usize))
                .help("Threads delivering MADs"),
        )
        .arg(
            Arg::new("delay-avg")
                .long("delay-avg")
                .default_value("50")
                .value_parser(value_parser!(u64))
                .help("Average delivery delay (usec)"),
        )
        .arg(
            Arg::new("delay-stddev")
                .long("delay-stddev")
                .default_value("10")
                .value_parser(value_parser!(u64))
                .help("Standard deviation of the delivery delay (usec)"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .required(false)
                .value_parser(value_parser!(u64))
                .help("Seed for delays and packet drops"),
        )
        .arg(
            Arg::new("guid-dump")
                .long("guid-dump")
                .required(false)
                .value_parser(value_parser!(PathBuf))
                .help("Write the assigned GUIDs to this file"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Log more (repeat for trace)"),
        )
        .get_matches();

    // Create logger
    let level = match matches.get_count("verbose") {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let (filter, handle) = reload::Layer::new(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();

    // Start the simulator
    let topology = matches
        .get_one::<PathBuf>("topology")
        .expect("Please provide a topology")
        .clone();
    let registry = Arc::new(Mutex::new(Registry::with_prefix("ibsim")));
    let config = Config {
        topology: Source::File(topology.clone()),
        workers: *matches.get_one::<usize>("workers").expect("default"),
        delay_avg: Duration::from_micros(*matches.get_one::<u64>("delay-avg").expect("default")),
        delay_stddev: Duration::from_micros(
            *matches.get_one::<u64>("delay-stddev").expect("default"),
        ),
        seed: matches.get_one::<u64>("seed").copied(),
        guid_dump: matches.get_one::<PathBuf>("guid-dump").cloned(),
        registry: registry.clone(),
    };
    let simulator = match Simulator::new(config) {
        Ok(simulator) => Arc::new(simulator),
        Err(err) => {
            error!(topology = %topology.display(), ?err, "failed to start simulator");
            return ExitCode::FAILURE;
        }
    };
    info!(
        topology = %topology.display(),
        nodes = simulator.fabric().len(),
        "simulator running"
    );

    // Serve the console until quit or end of input
    let console = Console::new(simulator.clone()).with_verbosity(move |level| {
        handle
            .modify(|filter| *filter = level)
            .map_err(|err| Error::InvalidArgument(err.to_string()))
    });
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let _ = write!(stdout, "ibsim> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!(?err, "failed to read console");
                break;
            }
        }
        match console.execute(&line) {
            Ok(Outcome::Continue(output)) if output.is_empty() => {}
            Ok(Outcome::Continue(output)) => {
                let _ = writeln!(stdout, "{}", output.trim_end());
            }
            Ok(Outcome::Quit) => break,
            Err(err) => {
                let _ = writeln!(stdout, "error: {err}");
            }
        }
    }
    simulator.shutdown();

    // Report what was moved
    let mut buffer = String::new();
    if encode(&mut buffer, &registry.lock().unwrap()).is_ok() {
        info!(metrics = %buffer.trim_end(), "simulator stopped");
    }
    ExitCode::SUCCESS
}
