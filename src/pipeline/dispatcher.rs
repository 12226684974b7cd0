//! Dispatcher: persists each normalized message once and runs the chain.
//!
//! Persistence is the dedup gate: a message whose `(source, id)` key is
//! already stored is not dispatched again. A storage failure does not
//! block dispatch; the message is handled and the failure logged.
//! Detached handler walks are tracked so shutdown can wait for them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::channels::MessageSink;
use crate::pipeline::handlers::HandlerChain;
use crate::pipeline::types::UnifiedMessage;
use crate::store::MessageStore;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The named handler ran to completion.
    Handled(&'static str),
    /// The named handler returned an error.
    Failed(&'static str),
    /// No handler matched.
    Unmatched,
    /// Already processed earlier; not dispatched.
    Duplicate,
}

pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    chain: Arc<HandlerChain>,
    in_flight: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn MessageStore>, chain: HandlerChain) -> Self {
        Self {
            store,
            chain: Arc::new(chain),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Handler walks started by `submit` that have not finished yet.
    pub async fn in_flight(&self) -> usize {
        let mut tasks = self.in_flight.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Wait up to `timeout` for detached handler walks to finish.
    /// Walks still running after that are aborted; returns their count.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let mut tasks = std::mem::take(&mut *self.in_flight.lock().await);
        if tasks.is_empty() {
            return 0;
        }
        info!(count = tasks.len(), "Waiting for in-flight handlers");
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        match drained {
            Ok(()) => 0,
            Err(_) => {
                let left = tasks.len();
                warn!(count = left, "Handlers still running at shutdown; aborting them");
                left
            }
        }
    }

    /// Persist and dispatch inline.
    pub async fn process(&self, message: &UnifiedMessage) -> DispatchOutcome {
        if !self.persist(message).await {
            return DispatchOutcome::Duplicate;
        }
        walk(&self.chain, message).await
    }

    /// Record the message. Returns whether it should be dispatched:
    /// `false` only for a confirmed duplicate.
    async fn persist(&self, message: &UnifiedMessage) -> bool {
        match self.store.save(message).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(id = %message.label(), "Duplicate message skipped");
                false
            }
            Err(e) => {
                error!(id = %message.label(), "Failed to persist message, dispatching anyway: {e}");
                true
            }
        }
    }
}

/// Run the first matching handler.
pub async fn walk(chain: &HandlerChain, message: &UnifiedMessage) -> DispatchOutcome {
    let Some(handler) = chain.select(message) else {
        warn!(id = %message.label(), kind = %message.message_type, "No handler matched");
        return DispatchOutcome::Unmatched;
    };

    let name = handler.name();
    debug!(id = %message.label(), handler = name, "Dispatching");
    match handler.handle(message).await {
        Ok(()) => {
            info!(id = %message.label(), handler = name, "Handled");
            DispatchOutcome::Handled(name)
        }
        Err(e) => {
            error!(id = %message.label(), handler = name, "Handler failed: {e}");
            DispatchOutcome::Failed(name)
        }
    }
}

#[async_trait]
impl MessageSink for Dispatcher {
    /// Persist inline so the poller's cursor only moves past stored
    /// messages, then walk the chain on a tracked background task.
    async fn submit(&self, message: UnifiedMessage) {
        if !self.persist(&message).await {
            return;
        }
        let chain = Arc::clone(&self.chain);
        let mut tasks = self.in_flight.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            walk(&chain, &message).await;
        });
    }
}
