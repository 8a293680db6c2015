//! # Command-Line Interface Module
//!
//! `apx-server` takes a single positional argument: the path to a JSON
//! configuration file (§6). Verbosity is controlled by repeated `-v`
//! flags rather than config keys, matching the logging levels the
//! process already derives from them.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// APX broker server - routes typed ports between nodes connected over TCP
/// or Unix domain sockets.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the JSON configuration file.
    pub config: PathBuf,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the human-facing stdout log stream; file logging (if
    /// configured) is unaffected.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}
