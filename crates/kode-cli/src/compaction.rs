//! LLM-powered history compression.
//!
//! Turns the compressible prefix of a conversation into a dated summary that
//! replaces that prefix in every later request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use kode_core::{ChatMessage, CompletionRequest, ContextCompressor, Error, Provider};

/// Summarizer system prompt template. `{current_date}` is replaced at call time.
const SUMMARY_PROMPT: &str = r#"You are summarizing the earlier part of a conversation between a user and a coding assistant so that the assistant can continue the work without the full transcript.

## Output Format

### [{current_date}] Conversation summary

- **Goal**: what the user is trying to accomplish
- **Decisions**: choices made and constraints agreed on
- **Files**: paths read, created or modified, with what changed
- **Commands and results**: tool calls that produced meaningful data, errors encountered
- **Open items**: anything left unfinished or explicitly deferred

## Rules

1. Preserve specifics: file paths, function names, error messages, exact values
2. Drop greetings, pleasantries and meta-commentary
3. When a decision supersedes an earlier one, keep only the latest and note the change
4. Today's date is {current_date}"#;

pub struct LlmCompressor {
    provider: Arc<dyn Provider>,
    model: Option<String>,
}

impl LlmCompressor {
    pub fn new(provider: Arc<dyn Provider>, model: Option<String>) -> Self {
        Self { provider, model }
    }

    fn current_date(&self) -> String {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    }

    fn build_request(&self, system: &str, user_content: &str) -> CompletionRequest {
        let mut request = CompletionRequest::new(vec![ChatMessage::user(user_content)])
            .with_system(system)
            .with_stream(false);

        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }

        request
    }
}

/// Render messages as a plain transcript for the summarizer.
pub fn format_transcript(messages: &[ChatMessage]) -> String {
    let mut formatted = String::new();
    for msg in messages {
        let content = msg.content.to_string_lossy();
        formatted.push_str(&format!("[{}]: {}\n", msg.role, content));

        for tc in &msg.tool_calls {
            formatted.push_str(&format!("  -> tool_call: {}({})\n", tc.name, tc.arguments));
        }

        if let Some(ref tc_id) = msg.tool_call_id {
            formatted.push_str(&format!("  (tool_call_id: {})\n", tc_id));
        }
    }
    formatted
}

#[async_trait]
impl ContextCompressor for LlmCompressor {
    async fn compress(
        &self,
        messages: &[ChatMessage],
        cancel: CancellationToken,
    ) -> Result<String, Error> {
        let system = SUMMARY_PROMPT.replace("{current_date}", &self.current_date());
        let request = self.build_request(&system, &format_transcript(messages));

        let response = self.provider.complete(request, cancel).await?;
        let result = response.message.content.to_string_lossy();

        if result.trim().is_empty() {
            return Err(Error::Unknown("Summarizer returned empty response".to_string()));
        }

        Ok(result)
    }
}
