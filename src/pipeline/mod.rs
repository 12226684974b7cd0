//! Message processing pipeline.
//!
//! Every normalized message from any source flows through:
//! 1. `Dispatcher::submit()`: dedup by `(source, id)` and persist
//! 2. `HandlerChain::select()`: first matching handler wins
//! 3. `Handler::handle()`: note saves, summaries, replies
//!
//! Replies are routed back by source through `Replier`.

pub mod dispatcher;
pub mod formatter;
pub mod handlers;
pub mod reply;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use formatter::BlockFormatter;
pub use handlers::{Handler, HandlerChain, HandlerDeps};
pub use reply::Replier;
pub use types::{MessageType, Source, UnifiedMessage};
