//! Periodic progress updates for a running transfer
//!
//! The reporter owns nothing but a handle to the shared byte counter. It
//! edits the status message on a fixed interval until cancelled.

use super::progress_render::render_progress_html;
use super::resilient::edit_message_safe_resilient;
use crate::transfer::TransferProgress;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Where rendered progress text goes
#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    /// Replaces the shown status; returns `false` if the update was dropped.
    async fn update(&self, text: &str) -> bool;
}

/// The chat message that shows the status of a transfer
pub struct StatusMessage {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
}

impl StatusMessage {
    #[must_use]
    pub const fn new(bot: Bot, chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            message_id,
        }
    }
}

#[async_trait]
impl StatusSink for StatusMessage {
    async fn update(&self, text: &str) -> bool {
        edit_message_safe_resilient(&self.bot, self.chat_id, self.message_id, text).await
    }
}

/// Running reporter task
pub struct ReporterHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReporterHandle {
    /// Stops the reporter and waits for its last edit to finish.
    pub async fn finish(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::debug!("Progress reporter ended abnormally: {e}");
        }
    }
}

/// Starts editing `sink` with the state of `progress` every `interval`.
///
/// The first update happens one interval after the start. Identical text is
/// not re-sent, and failed edits are skipped.
pub fn spawn_reporter<S: StatusSink>(
    sink: S,
    title: String,
    progress: Arc<TransferProgress>,
    interval: Duration,
) -> ReporterHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let period = interval.max(Duration::from_millis(100));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_text = String::new();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let text = render_progress_html(&title, &progress.snapshot());
                    if text == last_text {
                        continue;
                    }
                    if sink.update(&text).await {
                        last_text = text;
                    }
                }
            }
        }
    });

    ReporterHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        updates: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn update(&self, text: &str) -> bool {
            self.updates
                .lock()
                .map(|mut u| u.push(text.to_string()))
                .is_ok()
        }
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.updates.lock().map(|u| u.len()).unwrap_or_default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_on_interval_and_stops_on_finish() {
        let sink = RecordingSink::default();
        let progress = Arc::new(TransferProgress::new(100));
        let handle = spawn_reporter(
            sink.clone(),
            "📤 Uploading".to_string(),
            Arc::clone(&progress),
            Duration::from_secs(5),
        );

        progress.add(10);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(sink.count(), 1);

        progress.add(40);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.count(), 2);

        handle.finish().await;
        progress.add(50);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_text_is_not_resent() {
        let sink = RecordingSink::default();
        let progress = Arc::new(TransferProgress::new(0));
        let handle = spawn_reporter(
            sink.clone(),
            "📥 Downloading".to_string(),
            progress,
            Duration::from_secs(1),
        );

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        handle.finish().await;
        assert_eq!(sink.count(), 1);
    }
}
