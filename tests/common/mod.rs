//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Write a config file into `dir` and return its path.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("crawler.toml");
    std::fs::write(&path, contents).expect("write config");
    path
}

/// Run the built `crawlerd` binary with `args`.
pub fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_crawlerd"))
        .args(args)
        .output()
        .expect("spawn crawlerd")
}

/// TOML-quote a path for config fixtures.
pub fn toml_path(path: &Path) -> String {
    format!("{:?}", path.to_string_lossy())
}
