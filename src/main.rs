//! `crawlerd` binary entry point.
//!
//! Kept synchronous and thread-free: `start` daemonizes with `fork()`,
//! which is only well-defined while the process is single-threaded.

use clap::Parser as _;

use check_crawler::cli_app::{run, Cli};

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("crawlerd: {err}");
        std::process::exit(1);
    }
}
