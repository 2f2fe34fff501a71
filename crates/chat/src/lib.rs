#![deny(unsafe_code)]

/// Conversation domain: messages, per-box stores and the session orchestrator.
pub mod chat;
/// Client settings loaded from file and environment.
pub mod settings;
/// Scripted in-process backend for driving sessions from tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use kbchat_llm as llm;
