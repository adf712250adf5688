use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::ChatMessage;

/// Summarizes a prefix of the conversation into a single block of text.
/// Implemented in kode-cli with a concrete provider.
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    async fn compress(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<String, Error>;
}
