//! Generates task-specific worker instructions in place of a routed specialist.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::anthropic::{MessageSender, MessagesRequest};

/// Produces custom worker instructions for a task.
///
/// `Some(text)` replaces specialist routing for that one spawn; `None` means
/// generation failed and the caller routes as usual. Implementations must not
/// panic or propagate errors.
#[async_trait]
pub trait PromptGenerator: Send + Sync {
    async fn generate(&self, task: &str) -> Option<String>;
}

const SYSTEM_PROMPT: &str = "You write system prompts for autonomous security testing agents. \
     Prompts you write are specific, detailed and immediately actionable.";

/// [`PromptGenerator`] backed by a Messages API model.
pub struct LlmPromptGenerator {
    client: Arc<dyn MessageSender>,
    model: String,
    max_tokens: u32,
}

impl LlmPromptGenerator {
    pub fn new(client: Arc<dyn MessageSender>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens: 8000,
        }
    }
}

#[async_trait]
impl PromptGenerator for LlmPromptGenerator {
    async fn generate(&self, task: &str) -> Option<String> {
        let req = MessagesRequest::user(&self.model, self.max_tokens, generation_request(task))
            .with_system(SYSTEM_PROMPT)
            .with_temperature(0.3);

        let response = match self.client.send_message(&req).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "prompt generation call failed");
                return None;
            }
        };

        let text = response.text();
        if text.is_empty() {
            error!("prompt generation returned an empty response");
            return None;
        }

        info!(task = %preview(task, 100), "generated custom worker instructions");
        Some(text)
    }
}

fn generation_request(task: &str) -> String {
    format!(
        "A supervisor coordinates many worker agents during an approved penetration test. It \
         hands each worker one instruction, and you write the system prompt that worker will \
         run under.\n\
         \n\
         The system prompt must:\n\
         1. Stay focused on this specific instruction.\n\
         2. Give detailed knowledge, methodology and practical tips for carrying it out.\n\
         3. List concrete tools that help and explain how to use each one.\n\
         \n\
         Instruction:\n\
         \"\"\"\n\
         {task}\n\
         \"\"\"\n\
         \n\
         Reply with the system prompt and nothing else."
    )
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
