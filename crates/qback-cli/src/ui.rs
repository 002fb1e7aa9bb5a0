//! UI utilities for the qback CLI.

use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Local};
use qback_core::transfer::{format_size, format_speed, TransferProgress, TransferState};
use tokio::sync::watch;

/// Print a live progress line until the transfer ends or its session is
/// dropped.
pub async fn display_progress(mut rx: watch::Receiver<TransferProgress>) {
    let mut last_state = TransferState::Preparing;

    loop {
        let changed = tokio::time::timeout(Duration::from_secs(1), rx.changed()).await;
        let progress = rx.borrow_and_update().clone();

        if progress.state == TransferState::Transferring {
            print!("\r{}    ", progress_line(&progress));
            let _ = io::stdout().flush();
        }

        if progress.state != last_state {
            last_state = progress.state;
            match progress.state {
                TransferState::Finalizing => {
                    println!("\r{}    ", progress_line(&progress));
                    println!("  Verifying...");
                }
                TransferState::Completed | TransferState::Rejected => break,
                TransferState::Failed => {
                    println!();
                    break;
                }
                TransferState::Preparing | TransferState::Transferring => {}
            }
        }

        if matches!(changed, Ok(Err(_))) {
            break;
        }
    }
}

/// One progress line: percentage, chunk counter, bytes and speed.
pub fn progress_line(progress: &TransferProgress) -> String {
    format!(
        "  [{:>6.2}%] {} - chunk {}/{} - {} of {} - {}",
        progress.percentage(),
        progress.name,
        progress.chunks_done,
        progress.total_chunks,
        format_size(progress.bytes_transferred),
        format_size(progress.total_bytes),
        format_speed(progress.speed_bps as f64)
    )
}

/// Render unix seconds as local time, or `-` when out of range.
pub fn format_timestamp(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0).map_or_else(
        || "-".to_string(),
        |utc| {
            utc.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}

/// First 16 hex digits of a content hash.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}
