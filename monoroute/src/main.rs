//! Programmable HTTP reverse-proxy router binary: loads a route script
//! and a listen address from a config file, then runs one worker per
//! thread, each with its own routing controller and execution engine.

use std::thread;

use anyhow::Result;
use clap::Parser;
use monoio::utils::bind_to_cpu_set;
use tracing::info;

mod config;
mod dispatch;
mod http1;
mod runtime;
mod worker;

use config::Config;
use runtime::RuntimeWrapper;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file (JSON or TOML).
    #[clap(short, long, value_parser)]
    config: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = block_on_load(&args.config)?;
    let route_script = std::fs::read_to_string(&config.route_script)?;

    info!("monoroute starting with {} worker(s)", config.runtime.workers);

    let handles: Vec<_> = (0..config.runtime.workers)
        .map(|worker_id| {
            let config = config.clone();
            let route_script = route_script.clone();
            thread::Builder::new()
                .name(format!("monoroute-worker-{worker_id}"))
                .spawn(move || {
                    if config.runtime.cpu_affinity {
                        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                        let _ = bind_to_cpu_set([worker_id % cores]);
                    }
                    let mut rt = RuntimeWrapper::from(&config.runtime);
                    if let Err(e) = rt.block_on(worker::run_worker(config, route_script)) {
                        tracing::error!("worker {worker_id} exited with error: {e:?}");
                    }
                })
                .expect("spawn worker thread")
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Config loading uses `monoio::fs`, so it runs on a throwaway
/// single-threaded runtime before the worker pool starts.
fn block_on_load(path: &str) -> Result<Config> {
    let mut rt = monoio::RuntimeBuilder::<monoio::LegacyDriver>::new().build()?;
    rt.block_on(Config::load(path))
}
