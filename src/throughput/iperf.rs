//! iperf3 command line construction and JSON report normalization.

use serde::Deserialize;

use super::{Direction, DirectionMetrics, Protocol, SubtestError};

/// Parameters shared by every client-mode sub-test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestParams {
    pub target: String,
    pub port: u16,
    pub duration_secs: u32,
    pub protocol: Protocol,
    /// UDP target bandwidth in iperf3 notation (e.g. `100M`).
    pub bandwidth: String,
    pub bind_interface: Option<String>,
}

/// Parsed iperf3 JSON report (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct Iperf3Report {
    #[serde(default)]
    pub end: Option<Iperf3End>,
    /// Set by iperf3 itself when the test could not run.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3End {
    #[serde(default)]
    pub sum_sent: Option<Iperf3Sum>,
    #[serde(default)]
    pub sum_received: Option<Iperf3Sum>,
    /// Combined summary, present for UDP tests.
    #[serde(default)]
    pub sum: Option<Iperf3Sum>,
}

#[derive(Debug, Deserialize)]
pub struct Iperf3Sum {
    pub bits_per_second: f64,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub lost_packets: Option<u64>,
    #[serde(default)]
    pub lost_percent: Option<f64>,
}

/// Build the iperf3 client arguments for one direction.
pub fn client_args(params: &TestParams, direction: Direction) -> Vec<String> {
    let mut args = vec![
        "-c".to_string(),
        params.target.clone(),
        "-p".to_string(),
        params.port.to_string(),
        "-t".to_string(),
        params.duration_secs.to_string(),
        "-J".to_string(),
    ];
    if direction == Direction::Download {
        args.push("-R".to_string());
    }
    if params.protocol == Protocol::Udp {
        args.push("-u".to_string());
        args.push("-b".to_string());
        args.push(params.bandwidth.clone());
    }
    if let Some(iface) = &params.bind_interface {
        args.push("-B".to_string());
        args.push(iface.clone());
    }
    args
}

/// Build the iperf3 server arguments.
pub fn server_args(port: u16, bind_interface: Option<&str>) -> Vec<String> {
    let mut args = vec!["-s".to_string(), "-p".to_string(), port.to_string()];
    if let Some(iface) = bind_interface {
        args.push("-B".to_string());
        args.push(iface.to_string());
    }
    args
}

/// Parse an iperf3 JSON output string into a structured report.
pub fn parse_report(json_str: &str) -> Result<Iperf3Report, serde_json::Error> {
    serde_json::from_str(json_str)
}

fn bps_to_mbps(bits_per_second: f64) -> f64 {
    bits_per_second / 1_000_000.0
}

/// Flatten a report into the metrics for `direction`.
///
/// TCP reads the receiver side for downloads and the sender side for
/// uploads. UDP reads `end.sum`, defaulting absent jitter/loss fields to 0.
pub fn normalize(
    direction: Direction,
    protocol: Protocol,
    report: &Iperf3Report,
) -> Result<DirectionMetrics, SubtestError> {
    let missing = |field: &str| SubtestError::MalformedReport {
        direction,
        reason: format!("report has no `{field}` section"),
    };

    let end = report.end.as_ref().ok_or_else(|| missing("end"))?;

    match protocol {
        Protocol::Tcp => {
            let (field, sum) = match direction {
                Direction::Download => ("end.sum_received", end.sum_received.as_ref()),
                Direction::Upload => ("end.sum_sent", end.sum_sent.as_ref()),
            };
            let sum = sum.ok_or_else(|| missing(field))?;
            Ok(DirectionMetrics::Tcp {
                throughput_mbps: bps_to_mbps(sum.bits_per_second),
            })
        }
        Protocol::Udp => {
            let sum = end.sum.as_ref().ok_or_else(|| missing("end.sum"))?;
            Ok(DirectionMetrics::Udp {
                throughput_mbps: bps_to_mbps(sum.bits_per_second),
                jitter_ms: sum.jitter_ms.unwrap_or(0.0),
                lost_packets: sum.lost_packets.unwrap_or(0),
                lost_percent: sum.lost_percent.unwrap_or(0.0),
            })
        }
    }
}
