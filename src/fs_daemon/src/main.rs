mod cli;
mod config;
mod daemon;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::daemon::{run_daemon, RunOptions};

fn usage() -> String {
    format!(
        "usage: fs_daemon [<mountpoint>] [--config <path>] [--peer <address:port>]\n\
         defaults:\n\
         --config {}\n\
         mountpoint and the rendezvous URL come from the config file;\n\
         --peer joins one known peer directly and skips the rendezvous",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_args() -> Result<RunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.first().map(String::as_str) == Some("-h")
        || args.first().map(String::as_str) == Some("--help")
    {
        return Err(usage());
    }

    let mut options = RunOptions {
        config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        mountpoint: None,
        direct_peer: None,
    };

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                options.config_path = PathBuf::from(value);
            }
            "--peer" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --peer".to_string())?;
                options.direct_peer = Some(value.clone());
            }
            other if !other.starts_with('-') && options.mountpoint.is_none() => {
                options.mountpoint = Some(PathBuf::from(other));
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(options)
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_daemon(options) {
        error!("run fs_daemon failed: {}", err);
        std::process::exit(1);
    }
}
