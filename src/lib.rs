//! KSI completion core.
//!
//! A long-running daemon core that brokers concurrent LLM completion requests
//! across multiple backend providers while preserving per-conversation
//! ordering. Requests arrive as `completion:async` events, are serialized per
//! session by dispatcher loops, executed against a selected provider behind a
//! per-provider circuit breaker, persisted to an append-only per-session
//! response log, and answered with `completion:result` / `completion:error`
//! events. Transient failures are resubmitted by the retry controller with
//! exponential backoff.
//!
//! Transport, concrete provider implementations, and the host process
//! lifecycle live outside this crate; hosts construct a
//! [`completion::CompletionService`], bind provider callables, register the
//! event handlers on an [`events::EventRouter`], and drive
//! [`completion::CompletionService::run`].

pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod provider;
pub mod queue;
pub mod session;
pub mod store;
