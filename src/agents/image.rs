use std::sync::Arc;

use anyhow::Result;

use crate::agents::with_user_message;
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::streaming::{EventSink, TurnAnswer, synthesize};

pub const DEFAULT_VISION_MODEL: &str = "meta-llama/llama-4-scout-17b-16e-instruct";

/// Answers questions about an attached image with a vision model.
///
/// The request carries a multimodal user message; history stores the
/// flattened text form so later text-only models can read it.
pub struct ImageAgent {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl ImageAgent {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    pub async fn respond(
        &self,
        query: &str,
        image_url: &str,
        history: &[ChatMessage],
        sink: &EventSink,
    ) -> Result<TurnAnswer> {
        let request = ChatRequest::new(
            self.model_name.clone(),
            with_user_message(history, ChatMessage::user_with_image(query, image_url)),
        )
        .with_temperature(1.0);
        synthesize(self.model.as_ref(), request, false, sink).await
    }
}
