// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use clap::Parser;
use folioblocks::cli::{Args, LogLevel};
use folioblocks::global::*;
use folioblocks::node::{Node, NodeErr};
use folioblocks::settings::Settings;
use folioblocks::store::Secrets;
use log::*;
use mimalloc::MiMalloc;
use std::fs::OpenOptions;
use std::process;
use std::sync::Mutex;
use tokio::runtime::Builder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[cfg(not(windows))]
use signal_hook::consts::TERM_SIGNALS;
#[cfg(not(windows))]
use signal_hook::flag;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const EXIT_CONFIG: i32 = 1;

fn main() -> anyhow::Result<()> {
    #[cfg(not(windows))]
    for sig in TERM_SIGNALS {
        // A second signal while shutting down terminates immediately
        flag::register_conditional_shutdown(*sig, 1, EXIT_SIGNAL.clone())?;
        flag::register(*sig, EXIT_SIGNAL.clone())?;
    }

    let args = Args::parse();
    let _ = dotenvy::dotenv();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("folioblocks: {err}");
            process::exit(EXIT_CONFIG);
        }
    };

    if args.passcode {
        return print_passcode(&settings);
    }

    init_tracing(&settings)?;

    let rayon_threads = num_cpus::get().saturating_sub(1).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(rayon_threads)
        .build_global()?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;

    if let Err(err) = runtime.block_on(start_node(settings)) {
        error!("{}", err);
        drop(runtime);
        process::exit(err.exit_code());
    }

    Ok(())
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = Settings::new(args.config.as_deref(), std::env::vars())?;
    args.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}

async fn start_node(settings: Settings) -> Result<(), NodeErr> {
    info!(
        "Starting FolioBlocks v{} as {} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        settings.node.role,
        settings.network.host,
        settings.network.port
    );

    let node = Node::bootstrap(settings).await?;
    let result = node.run().await;

    // The data directory is re-sealed on every exit path
    request_exit();
    let closed = node.shutdown();

    result?;
    closed
}

fn print_passcode(settings: &Settings) -> anyhow::Result<()> {
    let secrets =
        Secrets::load(&settings.secrets_path()).map_err(|err| anyhow::anyhow!("secrets: {err}"))?;
    let passcode = secrets
        .passcode()
        .map_err(|err| anyhow::anyhow!("passcode: {err}"))?;
    println!(
        "{} (valid for {}s)",
        passcode.now(),
        passcode.seconds_left()
    );
    Ok(())
}

/// Installs the log filter, a stderr layer and, unless disabled, a plain
/// text layer appending to `node.log` in the data directory.
fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let level = LogLevel::from_setting(&settings.node.log_level)
        .map_or("info", |level| level.as_filter());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file = if settings.node.log_file {
        std::fs::create_dir_all(settings.data_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(settings.data_dir().join("node.log"))?;

        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .try_init()?;

    Ok(())
}
