//! iperfwatch -- unattended iperf3 throughput monitoring.
//!
//! In client mode the process runs download/upload iperf3 sub-tests on a
//! fixed cadence, appends each completed cycle to a CSV log, keeps the raw
//! reports on disk, and optionally publishes results to NATS. In server mode
//! it simply runs `iperf3 -s` as the counterpart endpoint.

pub mod config;
pub mod publish;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod throughput;

use std::sync::Arc;

use anyhow::Result;
use chrono::Local;

use config::ClientSettings;
use publish::NatsPublisher;
use scheduler::{Orchestrator, SystemClock};
use storage::{ArtifactStore, CsvRecorder};
use throughput::{Iperf3Runner, Protocol};

/// Run the client measurement loop until a storage failure or the cycle
/// limit ends it.
pub async fn run_client(settings: ClientSettings) -> Result<()> {
    storage::ensure_output_dir(&settings.output_dir).await?;

    let protocol = settings.test.protocol;
    let log_path = settings
        .output_dir
        .join(storage::log_file_name(protocol, &Local::now()));

    println!(
        "Testing {}:{} using {}",
        settings.test.target,
        settings.test.port,
        protocol.to_string().to_uppercase()
    );
    if protocol == Protocol::Udp {
        println!("UDP bandwidth: {}", settings.test.bandwidth);
    }
    if let Some(iface) = &settings.test.bind_interface {
        println!("Bound to interface: {}", iface);
    }
    match &settings.bus {
        Some(bus) => println!("NATS publishing to: {} on topic '{}'", bus.url, bus.topic),
        None => println!("NATS publishing: disabled"),
    }
    println!("Results: {}\n", log_path.display());

    tracing::info!(
        target_host = %settings.test.target,
        port = settings.test.port,
        %protocol,
        interval_secs = settings.interval.as_secs(),
        log = %log_path.display(),
        "starting client measurement loop"
    );

    let runner = Iperf3Runner::new(
        settings.iperf3_path.clone(),
        settings.test.clone(),
        ArtifactStore::new(&settings.output_dir),
    );
    let recorder = CsvRecorder::new(log_path, protocol);

    let mut orchestrator = Orchestrator::new(
        protocol,
        settings.interval,
        Box::new(runner),
        Box::new(recorder),
        Arc::new(SystemClock),
    );
    if let Some(bus) = &settings.bus {
        orchestrator = orchestrator.with_publisher(Box::new(NatsPublisher::new(
            bus.url.clone(),
            bus.topic.clone(),
            bus.timeout,
        )));
    }

    orchestrator.run(settings.max_cycles).await?;
    Ok(())
}
