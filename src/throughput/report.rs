//! Human-readable cycle summaries.

use super::CycleResult;

/// One-line summary, e.g. `Test #3: Down=500.00 Mbps, Up=250.00 Mbps`.
///
/// UDP cycles also show the loss percentage of each direction.
pub fn format_summary(result: &CycleResult) -> String {
    let mut summary = format!(
        "Test #{}: Down={:.2} Mbps, Up={:.2} Mbps",
        result.cycle_number(),
        result.download().throughput_mbps(),
        result.upload().throughput_mbps(),
    );

    if let (Some(dl), Some(ul)) = (
        result.download().lost_percent(),
        result.upload().lost_percent(),
    ) {
        summary.push_str(&format!(" | DL Loss: {:.2}%, UL Loss: {:.2}%", dl, ul));
    }

    summary
}
