use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use iperfwatch::config::{RawConfig, Settings};

#[derive(Parser)]
#[command(
    name = "iperfwatch",
    about = "Unattended iperf3 throughput monitor with CSV logging and NATS publishing",
    version,
    long_about = None
)]
struct Cli {
    /// TOML file with defaults for any option below
    #[arg(long, env = "IPERFWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Role: client or server
    #[arg(long, env = "MODE")]
    mode: Option<String>,

    /// iperf3 server to test against (client mode)
    #[arg(long, env = "SERVER_IP")]
    server_ip: Option<String>,

    /// iperf3 server port [default: 5201]
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Duration of each sub-test in seconds [default: 5]
    #[arg(long, env = "DURATION")]
    duration: Option<u32>,

    /// Seconds from one cycle start to the next [default: 10]
    #[arg(long, env = "INTERVAL")]
    interval: Option<u64>,

    /// Directory for the CSV log and raw reports [default: /data]
    #[arg(long, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// tcp or udp [default: tcp]
    #[arg(long, env = "PROTOCOL")]
    protocol: Option<String>,

    /// UDP target bandwidth, e.g. 100M [default: 100M]
    #[arg(long, env = "BANDWIDTH")]
    bandwidth: Option<String>,

    /// Interface or address passed to iperf3 -B
    #[arg(long, env = "BIND_INTERFACE")]
    bind_interface: Option<String>,

    /// NATS server URL; publishing is disabled when unset
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// NATS topic [default: speedtest]
    #[arg(long, env = "NATS_TOPIC")]
    nats_topic: Option<String>,

    /// Path to the iperf3 binary [default: iperf3]
    #[arg(long, env = "IPERF3_PATH")]
    iperf3_path: Option<String>,

    /// Stop after this many cycles (runs forever when unset)
    #[arg(long, env = "CYCLES")]
    cycles: Option<u64>,

    /// Upper bound in seconds for one publish [default: 5]
    #[arg(long, env = "PUBLISH_TIMEOUT")]
    publish_timeout_secs: Option<u64>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    fn layer(&self) -> RawConfig {
        RawConfig {
            mode: self.mode.clone(),
            server_ip: self.server_ip.clone(),
            port: self.port,
            duration: self.duration,
            interval: self.interval,
            output_dir: self.output_dir.clone(),
            protocol: self.protocol.clone(),
            bandwidth: self.bandwidth.clone(),
            bind_interface: self.bind_interface.clone(),
            nats_url: self.nats_url.clone(),
            nats_topic: self.nats_topic.clone(),
            iperf3_path: self.iperf3_path.clone(),
            cycles: self.cycles,
            publish_timeout: self.publish_timeout_secs,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let file_layer = match &cli.config {
        Some(path) => RawConfig::load(path)?,
        None => RawConfig::default(),
    };
    let settings = cli.layer().layered_over(file_layer).resolve()?;

    match settings {
        Settings::Server(server) => {
            tracing::info!(port = server.port, "Starting iperfwatch in server mode");
            iperfwatch::server::serve(&server).await?;
        }
        Settings::Client(client) => {
            tracing::info!(target_host = %client.test.target, "Starting iperfwatch in client mode");
            // Polled first so the handler is installed before iperf3 starts.
            tokio::select! {
                biased;
                _ = iperfwatch::server::shutdown_signal() => {
                    tracing::info!("shutdown signal received, stopping client loop");
                }
                res = iperfwatch::run_client(client) => res?,
            }
        }
    }

    Ok(())
}
