use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::future::join_all;
use log::{error, info, warn};
use tokio::sync::watch;

use nsq_rate_est::consumer::{Consumer, SubscribeOptions};
use nsq_rate_est::lookupd::LookupdClient;
use nsq_rate_est::{Args, Config, Error, Result, TopicSupervisor};

// How long consumers get to send CLS and drain before being dropped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from_args(&args)?;
    if config.estimator.capacity == 1 {
        warn!("a buffer of 1 sample never holds an interval; estimates will stay at the prior");
    }

    let lookupd = if config.lookupd_http_addresses.is_empty() {
        None
    } else {
        Some(Arc::new(LookupdClient::new(&config.lookupd_http_addresses)?))
    };

    // get a list of topics from nsqlookupd
    let mut topics: BTreeSet<String> = config.topics.iter().cloned().collect();
    if let Some(lookupd) = &lookupd {
        for url in lookupd.endpoints() {
            info!("querying {url}");
        }
        topics.extend(lookupd.topics().await?);
    }
    if topics.is_empty() {
        return Err(Error::NoTopics);
    }
    info!("monitoring {} topics: {:?}", topics.len(), topics);

    let supervisor = TopicSupervisor::new(&config.estimator, &topics);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::with_capacity(supervisor.len() + 1);
    for handle in supervisor.handles() {
        let opts = SubscribeOptions::new(handle.topic(), config.channel.as_str());
        let consumer = Consumer::new(
            opts,
            config.max_in_flight,
            handle.clone(),
            shutdown_rx.clone(),
        );
        let task = match &lookupd {
            Some(lookupd) if config.nsqd_tcp_addresses.is_empty() => tokio::spawn(
                consumer.connect_to_lookupds(lookupd.clone(), config.lookupd_poll_interval),
            ),
            _ => tokio::spawn(consumer.connect_to_nsqds(config.nsqd_tcp_addresses.clone())),
        };
        tasks.push(task);
    }

    if let Some(period) = config.report_interval {
        let reporter = supervisor.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            reporter.report_every(period, rx).await
        }));
    }

    wait_for_signal().await?;
    info!("shutting down");
    // Estimator updates never span an await point, so stopping here can't
    // leave a posterior half-folded.
    let _ = shutdown_tx.send(true);
    let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
        warn!("consumers did not stop within {SHUTDOWN_GRACE:?}, dropping them");
        for abort in aborts {
            abort.abort();
        }
    }

    supervisor.log_snapshots();
    Ok(())
}

// wait for ctrl-c or SIGTERM
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
