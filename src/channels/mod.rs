//! Source pollers and the plumbing they share.
//!
//! Every source is a `Poller`: one `poll_once` call fetches a batch since
//! the source's cursor, hands each normalized message to a `MessageSink`
//! and advances the cursor. `spawn_poller` drives a poller in its own task
//! until its shutdown flag is set, sleeping a cooldown after errors.

pub mod archive;
pub mod archive_bridge;
pub mod email;
pub mod email_poller;
pub mod media;
pub mod telegram;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ChannelError;
use crate::pipeline::types::UnifiedMessage;

pub use archive::{ArchiveClient, ArchivePoller, ChatEnvelope, EnvelopeDecryptor, MediaChunk};
pub use archive_bridge::ArchiveBridgeClient;
pub use email::{ImapMailbox, MailboxClient, MailboxConfig};
pub use email_poller::EmailPoller;
pub use media::MediaRetriever;
pub use telegram::{BotApi, TelegramClient, TelegramPoller};

/// Receives normalized messages from pollers.
///
/// `submit` returns once the message has been handed off (persisted, with
/// the handler walk possibly still running), which is when pollers advance
/// their cursors.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn submit(&self, message: UnifiedMessage);
}

/// One source's fetch-decode-emit cycle.
#[async_trait]
pub trait Poller: Send + 'static {
    /// Name used in logs (`chat-archive`, `bot-api`, `email`).
    fn name(&self) -> &'static str;

    /// Pause between successful cycles. Long-polling sources return zero
    /// because the server already blocks while waiting for data.
    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Fetch and emit one batch. Returns the number of messages emitted.
    async fn poll_once(&mut self) -> Result<usize, ChannelError>;
}

/// Cooperative stop flag shared by a poller task and its owner.
///
/// The flag is checked at the top of every cycle; `trigger` also wakes a
/// poller that is sleeping between cycles.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless shutdown is triggered first.
    /// Returns `false` when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent trigger is not missed.
        notified.as_mut().enable();
        if self.is_set() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = notified => false,
        }
    }
}

/// Run `poller` in a background task.
///
/// Returns a `JoinHandle` and a shutdown signal. Trigger the signal to stop
/// polling; the loop exits at the top of its next cycle, or right away if
/// it is sleeping. Errors never end the loop: they are logged and followed
/// by `cooldown` (or the error's own backoff hint), never shorter than the
/// poller's interval.
pub fn spawn_poller<P: Poller>(
    mut poller: P,
    cooldown: Duration,
) -> (JoinHandle<()>, Arc<ShutdownSignal>) {
    let shutdown = Arc::new(ShutdownSignal::default());
    let signal = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let name = poller.name();
        info!(source = name, interval_secs = poller.interval().as_secs(), "Poller started");

        loop {
            if shutdown.is_set() {
                break;
            }

            let delay = match poller.poll_once().await {
                Ok(count) => {
                    if count > 0 {
                        debug!(source = name, count, "Batch emitted");
                    }
                    poller.interval()
                }
                Err(e) => {
                    let delay = e
                        .backoff_hint()
                        .unwrap_or(cooldown)
                        .max(poller.interval());
                    let delay = with_jitter(delay);
                    error!(source = name, delay_ms = delay.as_millis() as u64, "Poll failed: {e}");
                    delay
                }
            };

            if !delay.is_zero() && !shutdown.sleep(delay).await {
                break;
            }
        }
        info!(source = name, "Poller shutting down");
    });

    (handle, signal)
}

/// Add up to 10% random jitter so pollers that fail together do not
/// retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    delay + Duration::from_millis(extra)
}
