//! kode-providers: streaming chat-completion client for kode
//!
//! Speaks the OpenAI-compatible `/chat/completions` protocol, both as a
//! server-sent event stream and as a single JSON response.

pub mod openai;
pub mod retry;
pub mod sse;

pub use openai::OpenAIProvider;
pub use retry::RetryPolicy;
