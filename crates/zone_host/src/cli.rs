//! Command-line interface for the zone host.

use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Options given on the command line. Everything except the config path
/// overrides the matching setting from the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub modules_file: Option<PathBuf>,
    pub unit_directory: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments. Exits with usage text on bad input.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG)),
            modules_file: matches.get_one::<String>("modules").map(PathBuf::from),
            unit_directory: matches.get_one::<String>("units").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

const DEFAULT_CONFIG: &str = "zone.toml";

fn command() -> Command {
    Command::new("Zone Host")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Loads zone server modules and drives their lifecycle")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Host configuration file")
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::new("modules")
                .short('m')
                .long("modules")
                .value_name("FILE")
                .help("Module list to load at startup"),
        )
        .arg(
            Arg::new("units")
                .short('u')
                .long("units")
                .value_name("DIR")
                .help("Directory searched for loadable units"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}
