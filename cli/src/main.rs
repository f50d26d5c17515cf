use std::process;
use std::thread;
use std::time::Duration;

use clap::{App, Arg, SubCommand};
use ferrite::facade::Instance;
use ferrite_support::config::{ClientConfig, ServerConfig};
use ferrite_support::logging;
use slog::info;

fn main() {
    let matches = App::new("ferrite")
        .version("0.1.0")
        .about("Hierarchical observable key-value store replication engine")
        .subcommand(
            SubCommand::with_name("server")
                .about("Run as a replication server")
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .required(true)
                        .help("Path to a server config TOML file"),
                ),
        )
        .subcommand(
            SubCommand::with_name("client")
                .about("Run as a replication client")
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .required(true)
                        .help("Path to a client config TOML file"),
                ),
        )
        .get_matches();

    let result = match matches.subcommand() {
        ("server", Some(sub)) => run_server(sub.value_of("config").unwrap()),
        ("client", Some(sub)) => run_client(sub.value_of("config").unwrap()),
        _ => {
            eprintln!("usage: ferrite <server|client> --config <FILE>");
            process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("ferrite: {}", err);
        process::exit(1);
    }
}

fn run_server(config_path: &str) -> Result<(), String> {
    let config = ServerConfig::load(config_path).map_err(|err| err.to_string())?;
    let log = logging::init_with(&config.logging);

    let instance = Instance::with_capacities(log.clone(), config.max_entries, config.max_listeners);
    info!(log, "starting server"; "bind_addr" => %config.bind_addr);
    instance
        .start_server_with_interval(config.bind_addr.port(), Duration::from_millis(config.update_interval_ms))
        .map_err(|err| err.to_string())?;

    wait_for_signal(&log);
    instance.stop_network();
    Ok(())
}

fn run_client(config_path: &str) -> Result<(), String> {
    let config = ClientConfig::load(config_path).map_err(|err| err.to_string())?;
    let log = logging::init_with(&config.logging);

    let instance = Instance::new(log.clone());
    info!(log, "starting client"; "server_addr" => %config.server_addr);
    instance
        .start_client_with_intervals(
            &config.server_addr.ip().to_string(),
            config.server_addr.port(),
            Duration::from_millis(config.connect_retry_ms),
            Duration::from_millis(config.sync_interval_ms),
        )
        .map_err(|err| err.to_string())?;

    wait_for_signal(&log);
    instance.stop_network();
    Ok(())
}

/// Runs until the process is killed. The reactor and its session own
/// thread; the main thread just stays alive and logs a heartbeat so an
/// operator tailing the log can tell the process hasn't wedged.
fn wait_for_signal(log: &slog::Logger) {
    loop {
        thread::sleep(Duration::from_secs(30));
        info!(log, "still running");
    }
}
