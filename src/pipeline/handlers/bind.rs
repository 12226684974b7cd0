//! Bind command: links a sender to their own note document.
//!
//! `绑定 <linkId> <docId> <token> [name]` (or `bind ...`) stores a binding
//! after checking the document is reachable; `我的绑定` / `my binding`
//! shows the current one.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Local;
use regex::Regex;
use tracing::{info, warn};

use crate::collaborators::{Block, NoteTarget};
use crate::error::HandlerError;
use crate::pipeline::handlers::{Handler, HandlerDeps, save_with_retry};
use crate::pipeline::types::{MessageType, UnifiedMessage};
use crate::store::Binding;

static BIND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:绑定|(?i:bind))\s+(\S+)\s+(\S+)\s+(\S+)(?:\s+(.+))?$")
        .expect("valid bind regex")
});

static SHOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:我的绑定|(?i:my\s+binding))$").expect("valid show-binding regex")
});

/// Parsed bind command.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Bind {
        link_id: &'a str,
        document_id: &'a str,
        token: &'a str,
        display_name: Option<&'a str>,
    },
    Show,
}

fn parse(text: &str) -> Option<Command<'_>> {
    let text = text.trim();
    if SHOW_RE.is_match(text) {
        return Some(Command::Show);
    }
    let caps = BIND_RE.captures(text)?;
    Some(Command::Bind {
        link_id: caps.get(1)?.as_str(),
        document_id: caps.get(2)?.as_str(),
        token: caps.get(3)?.as_str(),
        display_name: caps.get(4).map(|m| m.as_str().trim()),
    })
}

pub struct BindHandler {
    deps: Arc<HandlerDeps>,
}

impl BindHandler {
    pub fn new(deps: Arc<HandlerDeps>) -> Self {
        Self { deps }
    }

    async fn bind(
        &self,
        message: &UnifiedMessage,
        target: NoteTarget,
        display_name: Option<&str>,
    ) -> Result<(), HandlerError> {
        info!(
            sender = %message.from_user,
            link_id = %target.link_id,
            document_id = %target.document_id,
            "Bind request"
        );

        let title = match self.deps.notes.verify_access(&target).await {
            Ok(title) => title,
            Err(e) => {
                warn!(sender = %message.from_user, "Bind verification failed: {e}");
                self.deps
                    .reply(message, &format!("Binding failed: {e}"))
                    .await;
                return Ok(());
            }
        };
        let display_name = display_name.map(str::to_string).unwrap_or(title);

        let binding = Binding {
            sender: message.from_user.clone(),
            link_id: target.link_id.clone(),
            document_id: target.document_id.clone(),
            token: target.token.clone(),
            display_name: Some(display_name.clone()),
        };
        if let Err(e) = self.deps.bindings.upsert_binding(&binding).await {
            self.deps
                .reply(message, "Binding failed: could not store the binding")
                .await;
            return Err(e.into());
        }

        let notice = Block::text(format!(
            "✅ Bound - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        if let Err(e) = save_with_retry(self.deps.notes.as_ref(), &[notice], &target).await {
            warn!("Failed to write bind notice to the document: {e}");
        }

        self.deps
            .reply(
                message,
                &format!(
                    "Bound!\n\n📋 Document: {display_name}\n🔗 Link ID: {}\n📄 Document ID: {}",
                    target.link_id, target.document_id
                ),
            )
            .await;
        Ok(())
    }

    async fn show(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        let text = match self.deps.bindings.get_binding(&message.from_user).await? {
            Some(binding) => format!(
                "Current binding:\n\n📋 Document: {}\n🔗 Link ID: {}\n📄 Document ID: {}",
                binding.display_name.as_deref().unwrap_or("(unnamed)"),
                binding.link_id,
                binding.document_id
            ),
            None => "No note document bound.\n\n\
                     Send \"bind <linkId> <documentId> <token>\" to bind one.\n\n\
                     Example: bind abc123 xyz456 pdk_xxx"
                .to_string(),
        };
        self.deps.reply(message, &text).await;
        Ok(())
    }
}

#[async_trait]
impl Handler for BindHandler {
    fn name(&self) -> &'static str {
        "bind"
    }

    fn matches(&self, message: &UnifiedMessage) -> bool {
        message.message_type == MessageType::Text && parse(&message.content).is_some()
    }

    async fn handle(&self, message: &UnifiedMessage) -> Result<(), HandlerError> {
        match parse(&message.content) {
            Some(Command::Show) => self.show(message).await,
            Some(Command::Bind {
                link_id,
                document_id,
                token,
                display_name,
            }) => {
                let target = NoteTarget {
                    link_id: link_id.to_string(),
                    document_id: document_id.to_string(),
                    token: Some(token.to_string()),
                };
                self.bind(message, target, display_name).await
            }
            None => Ok(()),
        }
    }
}
