//! Boot-time configuration: picks a TOML file and a few command-line
//! flags. Grounded on `drmemd/src/config.rs`'s `toml` + `serde_derive`
//! + `clap` pipeline. This is the process's own bootstrap config, not
//! to be confused with `pool_config::PoolConfig`, the live operational
//! settings it seeds overrides into.

use std::env;

use serde_derive::Deserialize;
use tracing::Level;

use poolctl_api::{Error, Result};

use crate::pool_config::PoolConfigOverrides;

fn def_log_level() -> String {
    String::from("warn")
}

fn def_timezone() -> String {
    String::from("Europe/Madrid")
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "def_log_level")]
    pub(crate) log_level: String,

    #[serde(default = "def_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub pool: PoolConfigOverrides,
}

impl Config {
    pub fn get_log_level(&self) -> Level {
        match self.log_level.as_str() {
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::WARN,
        }
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Europe::Madrid)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: def_log_level(),
            timezone: def_timezone(),
            pool: PoolConfigOverrides::default(),
        }
    }
}

fn from_cmdline(mut cfg: Config) -> (bool, Config) {
    use clap::{crate_version, Arg, ArgAction, Command};

    let matches = Command::new("Pool Controller")
        .version(crate_version!())
        .about("Autonomous controller for a swimming pool installation")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .action(ArgAction::Set)
                .value_name("FILE")
                .help("Specifies the configuration file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Sets verbosity of log; can be used more than once"),
        )
        .arg(
            Arg::new("print_cfg")
                .long("print-config")
                .action(ArgAction::SetTrue)
                .help("Displays the configuration and exits"),
        )
        .get_matches();

    match matches.get_count("verbose") {
        0 => (),
        1 => cfg.log_level = String::from("info"),
        2 => cfg.log_level = String::from("debug"),
        _ => cfg.log_level = String::from("trace"),
    };

    (matches.get_flag("print_cfg"), cfg)
}

fn parse_config(contents: &str) -> Result<Config> {
    toml::from_str(contents).map_err(|e| Error::Config(format!("{}", e)))
}

async fn from_file(path: &str) -> Option<Result<Config>> {
    use tokio::fs;

    if let Ok(contents) = fs::read(path).await {
        let contents = String::from_utf8_lossy(&contents);
        Some(parse_config(&contents))
    } else {
        None
    }
}

async fn find_cfg() -> Result<Config> {
    const CFG_FILE: &str = "poolctl.toml";

    let mut dirs = vec![String::from("./")];

    if let Ok(home) = env::var("HOME") {
        dirs.push(format!("{}/.", home));
    }

    dirs.push(String::from("/usr/local/etc/"));
    dirs.push(String::from("/etc/"));

    for dir in dirs {
        let file = format!("{}{}", &dir, CFG_FILE);

        if let Some(cfg) = from_file(&file).await {
            return cfg;
        }
    }
    Ok(Config::default())
}

fn dump_config(cfg: &Config) {
    println!("Configuration:");
    println!("    log level: {}", cfg.get_log_level());
    println!("    timezone: {}\n", cfg.timezone);
}

#[tracing::instrument(name = "loading config")]
pub async fn get() -> Option<Config> {
    match find_cfg().await {
        Ok(cfg) => {
            let (print_cfg, cfg) = from_cmdline(cfg);

            if print_cfg {
                dump_config(&cfg);
                None
            } else {
                Some(cfg)
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "couldn't parse configuration file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_every_default() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.get_log_level(), Level::WARN);
        assert_eq!(cfg.timezone, "Europe/Madrid");
    }

    #[test]
    fn pool_overrides_are_optional() {
        let cfg = parse_config(
            r#"
            [pool]
            pool_ph_setpoint = 7.6
            "#,
        )
        .unwrap();
        assert_eq!(cfg.pool.pool_ph_setpoint, Some(7.6));
        assert_eq!(cfg.pool.pool_orp_mv_setpoint, None);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(parse_config("not valid [["), Err(Error::Config(_))));
    }
}
