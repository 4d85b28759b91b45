use std::{fs, net::SocketAddr, time::Duration};

use clap::Parser;
use hopper::{
    config::{self, Config, Telemetry},
    signals, workload,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to parse hopper config: {0}")]
    Config(#[from] config::Error),
    #[error("Hopper workload returned an error: {0}")]
    Workload(#[from] workload::Error),
}

fn default_config_path() -> String {
    "hopper.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// address for the prometheus exporter, overriding the configuration file
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

async fn inner_main(config: Config) -> Result<(), Error> {
    // Set up the telemetry sub-system. Hopper's internal metrics are made
    // available for scraping at a prometheus poll endpoint, if configured.
    if let Some(telemetry) = config.telemetry {
        let mut builder = PrometheusBuilder::new().with_http_listener(telemetry.prometheus_addr);
        for (k, v) in telemetry.global_labels {
            builder = builder.add_global_label(k, v);
        }
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let (shutdown_watcher, shutdown_broadcast) = signals::signal();

    //
    // WORKLOADS
    //
    let mut wsrv_joinset = JoinSet::new();
    for cfg in config.workload {
        let workload_server = workload::Server::new(cfg, shutdown_watcher.clone())?;
        wsrv_joinset.spawn(workload_server.run());
    }

    // We must be sure to drop any unused watcher at this point. Below in
    // `signal_and_wait` a remaining registered watcher would keep the run
    // from shutting down.
    drop(shutdown_watcher);

    let res = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            res = wsrv_joinset.join_next() => {
                match res {
                    None => {
                        info!("all workloads complete");
                        break Ok(());
                    }
                    Some(Ok(Ok(()))) => { /* Workload shut down successfully */ }
                    Some(Ok(Err(err))) => {
                        error!("Workload shut down unexpectedly: {err}");
                        break Err(Error::Workload(err));
                    }
                    Some(Err(err)) => error!("Could not join the spawned workload task: {err}"),
                }
            },
        }
    };
    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting hopper {version} run.");

    let args = Cli::parse();
    let contents = fs::read_to_string(&args.config_path)?;
    let mut config = Config::parse(&contents)?;
    if let Some(prometheus_addr) = args.prometheus_addr {
        let global_labels = config
            .telemetry
            .take()
            .map(|telemetry| telemetry.global_labels)
            .unwrap_or_default();
        config.telemetry = Some(Telemetry {
            prometheus_addr,
            global_labels,
        });
    }

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    // In-flight requests abandoned at shutdown may leave orphaned tasks;
    // bound how long we wait on them.
    runtime.shutdown_timeout(Duration::from_secs(10));
    info!("hopper run complete");
    res
}
