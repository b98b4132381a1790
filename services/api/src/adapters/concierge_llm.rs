//! services/api/src/adapters/concierge_llm.rs
//!
//! This module contains the adapter for the guest-facing concierge LLM.
//! It implements the `AnswerGenerator` port from the `core` crate.

const SYSTEM_INSTRUCTIONS: &str = r#"You are the digital concierge for a vacation rental property, answering questions from guests who are staying there or considering a stay.

The context you receive describes the property: its name, description, amenities, house rules, and the owner's FAQ entries.

Your role:
- Answer the guest's question using ONLY the property context when the question is about the property.
- If the context doesn't cover something, say so honestly and suggest the guest contact their host.
- Never invent amenities, policies, or prices that are not in the context.

Style for all answers:
- Sound like a friendly, competent front-desk person, not a brochure.
- Use contractions (don't, can't, it's) and keep a warm, helpful tone.
- Keep answers short: usually one to three sentences.
- Do not use markdown formatting, headings, or bullet lists; this is a chat window."#;

const USER_INPUT_TEMPLATE: &str = r#"PROPERTY CONTEXT:
---
{context}
---

GUEST QUESTION:
{question}

Answer the guest's question naturally, as if replying in a chat. If the property context doesn't cover it, say so and point them to their host."#;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use concierge_core::{
    domain::PropertyContext,
    ports::{AnswerGenerator, PortError, PortResult},
};
use regex::Regex;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `AnswerGenerator` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiConciergeAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiConciergeAdapter {
    /// Creates a new `OpenAiConciergeAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    /// Flattens the property context into the prompt block the model sees.
    fn render_context(context: &PropertyContext) -> String {
        let mut block = format!("NAME: {}\nDESCRIPTION: {}", context.name, context.description);
        if !context.amenities.is_empty() {
            block.push_str(&format!("\nAMENITIES: {}", context.amenities.join(", ")));
        }
        if !context.rules.is_empty() {
            block.push_str(&format!("\nHOUSE RULES: {}", context.rules));
        }
        for (question, answer) in &context.faqs {
            block.push_str(&format!("\nFAQ: {question} -> {answer}"));
        }
        block
    }

    /// The model is told not to use markdown, but it occasionally does
    /// anyway; strip the common offenders so the chat window shows plain
    /// text.
    fn strip_markdown(text: &str) -> String {
        let emphasis = Regex::new(r"[*_]{1,2}([^*_]+)[*_]{1,2}").unwrap();
        let without_emphasis = emphasis.replace_all(text, "$1");

        without_emphasis
            .lines()
            .map(|line| line.trim_start_matches('#').trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

//=========================================================================================
// `AnswerGenerator` Trait Implementation
//=========================================================================================

#[async_trait]
impl AnswerGenerator for OpenAiConciergeAdapter {
    /// Answers a guest's question grounded in the property's listing content.
    async fn generate_answer(
        &self,
        context: &PropertyContext,
        question: &str,
    ) -> PortResult<String> {
        let user_input = USER_INPUT_TEMPLATE
            .replace("{context}", &Self::render_context(context))
            .replace("{question}", question);

        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(SYSTEM_INSTRUCTIONS)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_input)
                .build()
                .map_err(|e| PortError::Unexpected(e.to_string()))?
                .into(),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .n(1)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        // Call the API and manually map the error if it occurs, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(content) = choice.message.content {
                Ok(Self::strip_markdown(&content))
            } else {
                Err(PortError::Unexpected(
                    "Concierge LLM response contained no text content.".to_string(),
                ))
            }
        } else {
            Err(PortError::Unexpected(
                "Concierge LLM returned no choices in its response.".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_rendering_includes_faqs_and_amenities() {
        let context = PropertyContext {
            name: "Seaside Villa".to_string(),
            description: "A villa by the sea.".to_string(),
            amenities: vec!["wifi".to_string(), "pool".to_string()],
            rules: "No parties.".to_string(),
            faqs: vec![("Is there wifi?".to_string(), "Yes, fiber.".to_string())],
        };
        let rendered = OpenAiConciergeAdapter::render_context(&context);
        assert!(rendered.contains("AMENITIES: wifi, pool"));
        assert!(rendered.contains("HOUSE RULES: No parties."));
        assert!(rendered.contains("FAQ: Is there wifi? -> Yes, fiber."));
    }

    #[test]
    fn markdown_is_stripped_from_answers() {
        let cleaned =
            OpenAiConciergeAdapter::strip_markdown("## Welcome\nThe pool is **heated** and _open_.");
        assert_eq!(cleaned, "Welcome The pool is heated and open.");
    }
}
