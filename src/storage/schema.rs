//! CSV column layout per protocol.

use chrono::Local;

use crate::throughput::{CycleResult, DirectionMetrics, Protocol};

pub const TCP_COLUMNS: [&str; 4] = ["timestamp", "test_number", "download_mbps", "upload_mbps"];

pub const UDP_COLUMNS: [&str; 10] = [
    "timestamp",
    "test_number",
    "download_mbps",
    "download_jitter_ms",
    "download_lost_packets",
    "download_lost_percent",
    "upload_mbps",
    "upload_jitter_ms",
    "upload_lost_packets",
    "upload_lost_percent",
];

/// Local time, same zone as the timestamp in the log file name.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Header row for a log of the given protocol.
pub fn header(protocol: Protocol) -> &'static [&'static str] {
    match protocol {
        Protocol::Tcp => &TCP_COLUMNS,
        Protocol::Udp => &UDP_COLUMNS,
    }
}

fn direction_fields(metrics: &DirectionMetrics) -> Vec<String> {
    match metrics {
        DirectionMetrics::Tcp { throughput_mbps } => vec![format!("{throughput_mbps:.2}")],
        DirectionMetrics::Udp {
            throughput_mbps,
            jitter_ms,
            lost_packets,
            lost_percent,
        } => vec![
            format!("{throughput_mbps:.2}"),
            jitter_ms.to_string(),
            lost_packets.to_string(),
            lost_percent.to_string(),
        ],
    }
}

/// Encode one cycle as a row matching `header(result.protocol())`.
pub fn row(result: &CycleResult) -> Vec<String> {
    let mut fields = vec![
        result
            .started_at()
            .with_timezone(&Local)
            .format(TIMESTAMP_FORMAT)
            .to_string(),
        result.cycle_number().to_string(),
    ];
    fields.extend(direction_fields(result.download()));
    fields.extend(direction_fields(result.upload()));
    fields
}
