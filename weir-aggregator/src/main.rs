#![forbid(unsafe_code)]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use weir_lib::aggregator::run_worker;
use weir_lib::config::{load_from_path, AggregatorConfig};
use weir_lib::shutdown::StopSignal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Weir event aggregator (UDP ingest -> store)")]
struct Cli {
    /// Path to configuration YAML file
    #[arg(short, long, value_name = "FILE", default_value = "weir-aggregator.yaml")]
    config: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let config = match load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) =
        weir_lib::telemetry::init_tracing(&config.log_level, config.log_file_name.as_deref())
    {
        eprintln!("failed to initialise logging: {err}");
        std::process::exit(1);
    }

    info!(
        port = config.port,
        workers = config.num_of_syslog_servers,
        endpoint = %config.endpoint,
        "configuration loaded"
    );

    let stop = StopSignal::new();
    let mut workers = Vec::new();
    for worker_id in 1..config.num_of_syslog_servers {
        let config: AggregatorConfig = config.clone();
        let stop = Arc::clone(&stop);
        workers.push(std::thread::spawn(move || run(&config, worker_id, stop)));
    }

    // Worker 0 stays on the main thread for the convenience of debugging.
    run(&config, 0, stop);

    for worker in workers {
        let _ = worker.join();
    }
}

fn run(config: &AggregatorConfig, worker_id: usize, stop: Arc<StopSignal>) {
    if let Err(err) = run_worker(config, worker_id, stop) {
        error!(%err, "syslog worker {worker_id} exited with error");
        std::process::exit(1);
    }
}
