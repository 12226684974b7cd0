//! Email poller: walks every configured mailbox on a fixed interval.
//!
//! Each mailbox keeps its own cursor (`email:<account>`), the highest UID
//! handed to the sink. Mailboxes are polled one after another; one failing
//! mailbox does not hold up the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::channels::email::{EmailConfig, FetchedEmail, MailboxClient, MailboxConfig};
use crate::channels::{MessageSink, Poller};
use crate::error::ChannelError;
use crate::pipeline::types::{MessageType, Source, UnifiedMessage};
use crate::store::{Cursor, CursorStore};

/// Cursor key for a mailbox.
pub fn cursor_key(account: &str) -> String {
    format!("email:{account}")
}

/// Convert a fetched email into a unified message.
///
/// The id is `<account>:<uid>`; the subject and sender parts go into the
/// raw payload for the digest handler.
pub fn to_unified(account: &str, email: &FetchedEmail) -> UnifiedMessage {
    UnifiedMessage::new(
        Source::Email,
        format!("{account}:{}", email.uid),
        MessageType::Text,
        email.sender_display(),
        email.body.clone(),
        email.date,
    )
    .with_raw(serde_json::json!({
        "account": account,
        "uid": email.uid,
        "subject": email.subject,
        "sender_name": email.sender_name,
        "sender_address": email.sender_address,
        "message_id": email.message_id,
    }))
}

pub struct EmailPoller {
    client: Arc<dyn MailboxClient>,
    mailboxes: Vec<(MailboxConfig, Cursor)>,
    sink: Arc<dyn MessageSink>,
    interval: Duration,
    fetch_limit: usize,
}

impl EmailPoller {
    pub fn new(
        client: Arc<dyn MailboxClient>,
        config: &EmailConfig,
        store: Arc<dyn CursorStore>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let mailboxes = config
            .mailboxes
            .iter()
            .map(|mailbox| {
                let cursor = Cursor::new(
                    Arc::clone(&store),
                    cursor_key(&mailbox.account),
                    config.uid_floor,
                );
                (mailbox.clone(), cursor)
            })
            .collect();
        Self {
            client,
            mailboxes,
            sink,
            interval: Duration::from_secs(config.poll_interval_secs),
            fetch_limit: config.fetch_limit,
        }
    }
}

#[async_trait]
impl Poller for EmailPoller {
    fn name(&self) -> &'static str {
        "email"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll every mailbox once. Fails only when every mailbox failed.
    async fn poll_once(&mut self) -> Result<usize, ChannelError> {
        let mut emitted = 0;
        let mut last_error = None;
        let mut failures = 0;

        for (mailbox, cursor) in &mut self.mailboxes {
            let since = cursor.get_position().await;
            let mut emails = match self
                .client
                .fetch_since(mailbox, since, self.fetch_limit)
                .await
            {
                Ok(emails) => emails,
                Err(e) => {
                    warn!(account = %mailbox.account, "Mailbox poll failed: {e}");
                    failures += 1;
                    last_error = Some(e);
                    continue;
                }
            };
            if emails.is_empty() {
                continue;
            }

            emails.sort_by_key(|e| e.uid);
            let mut max_uid = since;
            for email in emails.iter().filter(|e| e.uid > since) {
                info!(account = %mailbox.account, uid = email.uid, subject = %email.subject, "New email");
                self.sink.submit(to_unified(&mailbox.account, email)).await;
                max_uid = max_uid.max(email.uid);
                emitted += 1;
            }
            cursor.set_position(max_uid).await;
        }

        match last_error {
            Some(e) if failures == self.mailboxes.len() => Err(e),
            _ => Ok(emitted),
        }
    }
}
