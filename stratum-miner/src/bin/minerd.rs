//! Main entry point for the stratum-miner daemon.
//!
//! The only argument is an optional path to the JSON configuration; without
//! it `$STRATUM_MINER_CONFIG` or `minerd.json` is used.

use std::env;

use stratum_miner::{config::Config, daemon::Daemon, tracing};

fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let daemon = Daemon::new(Config::path_from_args(env::args().skip(1)));
    daemon.run()
}
