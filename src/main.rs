//! # APX Broker Server - Main Entry Point
//!
//! Parses the CLI, loads the JSON config it points at, wires up logging,
//! then starts listening on whichever transports the config names. A
//! config file naming no extensions is valid and simply starts a server
//! with nothing to accept - useful when the `Server` is driven some other
//! way (tests, embedding).

use anyhow::{Context, Result};
use apx_server::cli::Args;
use apx_server::config::Config;
use apx_server::server::Server;
use apx_server::transport::{TcpTransport, UnixTransport};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            // Logging isn't wired up yet if the config itself failed to load;
            // this is the one place the binary prints straight to stderr.
            eprintln!("failed to load config {}: {e:#}", args.config.display());
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&args, &config);

    info!("starting apx-server");

    let server = Server::new();
    let mut listeners = Vec::new();

    if let Some(extensions) = &config.extensions {
        if let Some(tcp) = &extensions.tcp_server {
            listeners.push(spawn_tcp_listener(&server, tcp.bind.clone())?);
        }
        if let Some(unix) = &extensions.unix_server {
            listeners.push(spawn_unix_listener(&server, unix.path.clone())?);
        }
    }

    if listeners.is_empty() {
        info!("no listening transport configured, idling");
    }

    for handle in listeners {
        let _ = handle.join();
    }

    Ok(())
}

fn spawn_tcp_listener(server: &std::sync::Arc<Server>, bind: String) -> Result<std::thread::JoinHandle<()>> {
    let listener = std::net::TcpListener::bind(&bind).with_context(|| format!("binding TCP listener on {bind}"))?;
    info!(bind = %bind, "listening for TCP connections");
    let server = server.clone();
    Ok(std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = server.accept(Box::new(TcpTransport::new(stream))) {
                        error!(error = %e, "failed to accept TCP connection");
                    }
                }
                Err(e) => error!(error = %e, "TCP accept failed"),
            }
        }
    }))
}

fn spawn_unix_listener(server: &std::sync::Arc<Server>, path: String) -> Result<std::thread::JoinHandle<()>> {
    let _ = std::fs::remove_file(&path);
    let listener = std::os::unix::net::UnixListener::bind(&path)
        .with_context(|| format!("binding Unix listener at {path}"))?;
    info!(path = %path, "listening for Unix domain socket connections");
    let server = server.clone();
    Ok(std::thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = server.accept(Box::new(UnixTransport::new(stream))) {
                        error!(error = %e, "failed to accept Unix connection");
                    }
                }
                Err(e) => error!(error = %e, "Unix accept failed"),
            }
        }
    }))
}

/// Sets up the detailed (file or stderr) log layer plus, unless `--quiet`,
/// a colorized stdout layer. The CLI's `-v` flags take precedence over the
/// config file's `logging.level` when present; returns the file-appender
/// guard, which must stay alive for the process lifetime.
fn init_logging(args: &Args, config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.verbose > 0 {
        match args.verbose {
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    } else {
        parse_level(&config.logging.level)
    };

    let guard;
    let detailed_log_layer;
    match config.logging.file.as_deref() {
        None => {
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
        Some(path_str) => {
            let log_path = std::path::Path::new(path_str);
            let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("apx-server.log"));
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    guard
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}
