//! Wires configuration, collaborators, the dispatcher and the pollers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channels::archive::ArchivePollerConfig;
use crate::channels::{
    ArchiveBridgeClient, ArchivePoller, BotApi, EmailPoller, EnvelopeDecryptor, ImapMailbox,
    MediaRetriever, MessageSink, ShutdownSignal, TelegramClient, TelegramPoller, spawn_poller,
};
use crate::collaborators::{
    CraftClient, HttpObjectStorage, HttpPageFetcher, LlmAgents, Notifier, ObjectStorage,
    WebhookNotifier,
};
use crate::config::RelayConfig;
use crate::error::{ConfigError, Error};
use crate::pipeline::types::Source;
use crate::pipeline::{BlockFormatter, Dispatcher, HandlerChain, HandlerDeps, Replier};
use crate::store::{Cursor, LibSqlBackend};

/// A running poller.
struct PollerTask {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<ShutdownSignal>,
}

/// The running relay: one task per enabled source.
pub struct Relay {
    pollers: Vec<PollerTask>,
    dispatcher: Arc<Dispatcher>,
}

impl Relay {
    /// Build every component from `config` and start the enabled pollers.
    pub async fn start(config: &RelayConfig, db: Arc<LibSqlBackend>) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.media_dir).map_err(ConfigError::Io)?;

        let bot: Option<Arc<TelegramClient>> = config
            .telegram
            .as_ref()
            .map(|t| Arc::new(TelegramClient::new(t.bot_token.clone())));

        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            HandlerChain::standard(Arc::new(build_deps(config, db.clone(), bot.clone()))),
        ));
        let sink: Arc<dyn MessageSink> = dispatcher.clone();

        let mut pollers = Vec::new();
        let cooldown = config.poller_cooldown;

        if let Some(archive) = &config.archive {
            let client = Arc::new(ArchiveBridgeClient::new(
                archive.bridge_url.clone(),
                archive.bridge_token.clone(),
            ));
            let decryptor = EnvelopeDecryptor::from_pem(archive.private_key_pem.expose_secret())?;
            let poller = ArchivePoller::new(
                client.clone(),
                decryptor,
                MediaRetriever::new(client, config.media_dir.clone()),
                Cursor::new(db.clone(), Source::ChatArchive.as_str(), archive.cursor_floor),
                Arc::clone(&sink),
                ArchivePollerConfig {
                    self_user_id: archive.self_user_id.clone(),
                    batch_limit: archive.batch_limit,
                    poll_timeout: archive.poll_timeout,
                },
            );
            pollers.push(start(poller, "chat-archive", cooldown));
        }

        if let (Some(telegram), Some(bot)) = (&config.telegram, &bot) {
            let api: Arc<dyn BotApi> = bot.clone();
            let poller = TelegramPoller::new(
                api,
                Cursor::new(db.clone(), Source::BotApi.as_str(), telegram.cursor_floor),
                Arc::clone(&sink),
                config.media_dir.clone(),
            )
            .with_poll_timeout(telegram.poll_timeout_secs);
            pollers.push(start(poller, "bot-api", cooldown));
        }

        if let Some(email) = &config.email {
            let poller = EmailPoller::new(Arc::new(ImapMailbox), email, db.clone(), Arc::clone(&sink));
            pollers.push(start(poller, "email", cooldown));
        }

        if pollers.is_empty() {
            warn!("No sources enabled; nothing will be ingested");
        }
        Ok(Self {
            pollers,
            dispatcher,
        })
    }

    pub fn poller_names(&self) -> Vec<&'static str> {
        self.pollers.iter().map(|p| p.name).collect()
    }

    /// Stop every poller, then let in-flight handlers finish. Both phases
    /// share one `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        for poller in &self.pollers {
            poller.shutdown.trigger();
        }
        let names: Vec<_> = self.pollers.iter().map(|p| p.name).collect();
        let joins = futures::future::join_all(self.pollers.into_iter().map(|p| p.handle));
        match tokio::time::timeout(timeout, joins).await {
            Ok(_) => info!(pollers = ?names, "Pollers stopped"),
            Err(_) => warn!(pollers = ?names, "Pollers did not stop in time"),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let aborted = self.dispatcher.drain(remaining).await;
        if aborted == 0 {
            info!("In-flight handlers finished");
        }
    }
}

fn start<P: crate::channels::Poller>(
    poller: P,
    name: &'static str,
    cooldown: Duration,
) -> PollerTask {
    let (handle, shutdown) = spawn_poller(poller, cooldown);
    PollerTask {
        name,
        handle,
        shutdown,
    }
}

/// Handler collaborators from configuration.
fn build_deps(
    config: &RelayConfig,
    db: Arc<LibSqlBackend>,
    bot: Option<Arc<TelegramClient>>,
) -> HandlerDeps {
    let notes = Arc::new(CraftClient::new(
        config.notes.api_base.clone(),
        config.notes.api_token.clone(),
    ));

    let storage: Option<Arc<dyn ObjectStorage>> = config.media_upload_url.as_ref().map(|url| {
        Arc::new(HttpObjectStorage::new(
            url.clone(),
            config.media_public_base_url.clone(),
        )) as Arc<dyn ObjectStorage>
    });

    let notifier: Option<Arc<dyn Notifier>> = config
        .notification_url
        .as_ref()
        .map(|url| Arc::new(WebhookNotifier::new(url.clone())) as Arc<dyn Notifier>);

    let agents = config.llm.as_ref().and_then(|llm| match LlmAgents::create(llm) {
        Ok(agents) => Some(agents),
        Err(e) => {
            warn!("LLM agents disabled: {e}");
            None
        }
    });

    HandlerDeps {
        notes,
        bindings: db,
        default_target: config.notes.default_target.clone(),
        formatter: BlockFormatter::new(config.media_public_base_url.clone()),
        replier: Replier::new(bot.map(|b| b as Arc<dyn BotApi>), notifier),
        summarizer: agents.as_ref().map(|a| Arc::clone(&a.summarizer)),
        classifier: agents.as_ref().map(|a| Arc::clone(&a.classifier)),
        storage,
        pages: Arc::new(HttpPageFetcher::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotesConfig;

    fn config(media_dir: &std::path::Path) -> RelayConfig {
        RelayConfig {
            db_path: media_dir.join("relay.db"),
            media_dir: media_dir.join("media"),
            log_dir: None,
            status_port: None,
            poller_cooldown: Duration::from_secs(15),
            archive: None,
            telegram: None,
            email: None,
            notes: NotesConfig {
                api_base: "http://127.0.0.1:9".into(),
                api_token: None,
                default_target: None,
            },
            media_upload_url: None,
            media_public_base_url: None,
            notification_url: None,
            llm: None,
        }
    }

    #[tokio::test]
    async fn start_and_shutdown_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let relay = Relay::start(&config(dir.path()), db).await.unwrap();
        assert!(relay.poller_names().is_empty());
        assert!(dir.path().join("media").is_dir());

        tokio::time::timeout(Duration::from_secs(2), relay.shutdown(Duration::from_secs(1)))
            .await
            .expect("shutdown should finish within its timeout");
    }
}
