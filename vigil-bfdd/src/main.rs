//
// Copyright (c) The Vigil Project Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;
mod pidfile;

use clap::{App, Arg};
use config::Config;
use tracing::{error, info};
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;
use vigil_bfd::master::Master;
use vigil_bfd::notify::ConsumerKind;

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

fn init_tracing(config: &config::Logging, debug_level: u64) {
    let default_directive = match debug_level {
        0 => "vigil=info",
        1 => "vigil=debug",
        _ => "vigil=trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_directive.parse().unwrap())
        .from_env_lossy();

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(config.stdout.show_thread_id)
            .with_file(config.stdout.show_source)
            .with_line_number(config.stdout.show_source)
            .with_ansi(config.stdout.colors);
        match config.stdout.style {
            config::LoggingFmtStyle::Compact => layer.compact().boxed(),
            config::LoggingFmtStyle::Full => layer.boxed(),
            config::LoggingFmtStyle::Json => layer.json().boxed(),
            config::LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .init();
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("Vigil BFD daemon")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .arg(
            Arg::with_name("config-test")
                .short("t")
                .long("config-test")
                .help("Check the configuration for validity and exit."),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .multiple(true)
                .help("Increase the logging verbosity."),
        )
        .arg(
            Arg::with_name("namespace")
                .short("n")
                .long("namespace")
                .value_name("name")
                .help("Instance name qualifying the runtime files."),
        )
        .get_matches();

    let config_file = matches
        .value_of("config")
        .unwrap_or(config::DFLT_CONFIG_PATH)
        .to_owned();

    // Read configuration file.
    let config = match Config::load(&config_file) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{config_file}: {error}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // If we are just testing the configuration, then we terminate now.
    if matches.is_present("config-test") {
        println!("{config_file}: configuration is valid");
        return;
    }

    // Initialize tracing.
    init_tracing(&config.logging, matches.occurrences_of("debug"));

    // Hold the pidfile until the process exits.
    let pidfile_name = match matches.value_of("namespace") {
        Some(namespace) => format!("vigil-bfdd_{namespace}"),
        None => "vigil-bfdd".to_owned(),
    };
    let _pidfile = match pidfile::PidFile::new(&pidfile_name) {
        Ok(pidfile) => pidfile,
        Err(error) => {
            error!(%error, "cannot write pidfile");
            std::process::exit(EXIT_FATAL);
        }
    };

    // We're ready to go!
    info!("starting up");

    let (mut master, channels) = Master::new(config.bfd());

    // Connect the event pipes of the sibling daemons.
    for (kind, path) in [
        (ConsumerKind::Vrrp, &config.pipes.vrrp),
        (ConsumerKind::Checker, &config.pipes.checker),
    ] {
        if let Some(path) = path
            && let Err(error) = master.publisher.add_consumer(kind, path)
        {
            error!(consumer = %kind, %error, "cannot open event pipe");
            std::process::exit(EXIT_FATAL);
        }
    }

    // Main loop.
    //
    // All protocol state lives on this single thread; child tasks only feed
    // the dispatcher through channels.
    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(master.run(channels, move || {
            Config::load(&config_file)
                .map(|config| config.bfd())
                .map_err(|error| error.to_string())
        }));

    match result {
        Ok(()) => info!("terminated"),
        Err(error) => {
            error!(%error, "fatal error");
            std::process::exit(EXIT_FATAL);
        }
    }
}
