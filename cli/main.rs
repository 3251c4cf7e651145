#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::Parser;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;

use ridgesite::local;
use ridgesite::settings::SiteSettings;

#[derive(Parser)]
#[command(
    name = "ridgesite",
    about = "Run one round of the local-site computation for single-shot decentralized ridge regression",
    long_about = "Reads one JSON request from standard input, decides the round from its \
                  computation_phase marker, and writes one JSON response to standard output. \
                  Logs go to standard error; set RUST_LOG to change verbosity."
)]
struct Cli {
    /// Read the request from this file instead of standard input
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Site settings file (.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Pretty-print the response document
    #[arg(long)]
    pretty: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = match &cli.config {
        Some(path) => {
            log::info!("Loading settings from '{}'", path.display());
            SiteSettings::load(path)?
        }
        None => SiteSettings::default(),
    };

    let raw = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let request: serde_json::Value = serde_json::from_str(&raw)?;

    // Nothing reaches stdout unless the whole round succeeded.
    let response = local::run(request, &settings)?;

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if cli.pretty {
        serde_json::to_writer_pretty(&mut handle, &response)?;
    } else {
        serde_json::to_writer(&mut handle, &response)?;
    }
    writeln!(handle)?;
    handle.flush()?;
    Ok(())
}
