use clap::{App, Arg};
use std::sync::Arc;

use filament::broker::core::BrokerCore;
use filament::broker::discovery::LightweightDiscovery;
use filament::broker::socket_manager::MioSocketManager;
use lumen::logging;

mod config;

use crate::config::BrokerConfig;

fn main() {
    let matches = App::new("RDMnet Broker")
        .version("0.1.0")
        .author("Filament Works")
        .about("Routes RDM traffic between controllers and devices on one scope.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the broker config file")
                .required(true),
        )
        .arg(
            Arg::with_name("scope")
                .long("scope")
                .takes_value(true)
                .help("Overrides the configured scope"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .help("Overrides the configured listen port"),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let mut config = BrokerConfig::load(config_path).expect("Error loading broker config file");

    if let Some(scope) = matches.value_of("scope") {
        config.scope = scope.to_string();
    }
    if let Some(port) = matches.value_of("port") {
        config.listen_port = port.parse().expect("Error parsing port override");
    }

    let settings = config.into_settings().expect("Error in broker config");

    let log = logging::init();
    logging::info!(log, "starting RDMnet broker"; "scope" => &settings.scope);

    let socket_manager = Arc::new(MioSocketManager::new(&log));
    let discovery = Arc::new(LightweightDiscovery);

    let core = BrokerCore::new(settings, socket_manager, discovery, &log)
        .expect("Error constructing broker core");
    core.startup().expect("Error starting broker");

    core.run();
    core.shutdown();
}
