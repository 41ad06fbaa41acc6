use crate::transfer::ProgressSnapshot;
use crate::utils::{escape_html, format_duration, human_bytes, truncate_str};

const BAR_CELLS: usize = 10;

/// Render a transfer snapshot into Telegram-ready HTML.
#[must_use]
pub fn render_progress_html(title: &str, snapshot: &ProgressSnapshot) -> String {
    let eta = snapshot
        .eta
        .map_or_else(|| "—".to_string(), format_duration);

    [
        format!("<b>{}</b>", escape_html(&truncate_str(title, 120))),
        String::new(),
        format!("[{}] {:.1}%", progress_bar(snapshot.percent), snapshot.percent),
        format!(
            "📦 {} / {}",
            human_bytes(snapshot.seen),
            human_bytes(snapshot.total)
        ),
        format!("🚀 {}/s", human_bytes(speed_bytes(snapshot.speed))),
        format!("⏱ ETA: {eta}"),
    ]
    .join("\n")
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn speed_bytes(speed: f64) -> u64 {
    if speed.is_finite() && speed > 0.0 {
        speed as u64
    } else {
        0
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn progress_bar(percent: f64) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * BAR_CELLS as f64).floor() as usize;
    let filled = filled.min(BAR_CELLS);
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn renders_bar_and_totals() {
        let snap = ProgressSnapshot::compute(512 * 1024, 1024 * 1024, Duration::from_secs(2));
        let html = render_progress_html("📤 Uploading <clip>.mp4", &snap);

        assert!(html.starts_with("<b>📤 Uploading &lt;clip&gt;.mp4</b>"));
        assert!(html.contains("[█████░░░░░] 50.0%"));
        assert!(html.contains("512.00 KB / 1.00 MB"));
        assert!(html.contains("256.00 KB/s"));
        assert!(html.contains("ETA: 2s"));
    }

    #[test]
    fn bar_bounds() {
        assert_eq!(progress_bar(0.0), "░".repeat(10));
        assert_eq!(progress_bar(100.0), "█".repeat(10));
        assert_eq!(progress_bar(250.0), "█".repeat(10));
    }

    #[test]
    fn unknown_eta_uses_dash() {
        let snap = ProgressSnapshot::compute(0, 10, Duration::ZERO);
        assert!(render_progress_html("x", &snap).contains("ETA: —"));
    }
}
