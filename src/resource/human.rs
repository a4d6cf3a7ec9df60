//! Human-operator resource handler.
//!
//! Some attributes cannot be enriched mechanically. This handler routes the
//! request onto a bounded prompt queue; whatever drains the queue (a review
//! UI, a terminal session) answers over a one-shot channel. If no operator
//! is attached the attempt fails like any other handler failure and the
//! iQuery falls back.

use axum::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{HandlerError, ResourceHandler, ResourceRequest, ResourceResponse, ResponseExtractor};

/// One pending question for a human operator.
#[derive(Debug)]
pub struct OperatorPrompt {
    /// Identifier of the entity being enriched.
    pub entity_id: String,
    /// The attribute the answer will fill.
    pub target_attribute: String,
    /// The rendered question.
    pub prompt: String,
    reply: oneshot::Sender<String>,
}

impl OperatorPrompt {
    /// Answers the prompt. Returns the answer back if the asking iQuery has
    /// already given up (timed out or been dropped).
    pub fn respond(self, answer: impl Into<String>) -> Result<(), String> {
        self.reply.send(answer.into())
    }
}

/// Resource handler that asks a human.
pub struct OperatorHandler {
    name: String,
    outbox: mpsc::Sender<OperatorPrompt>,
    extractor: ResponseExtractor,
}

/// Creates an operator handler and the receiving end of its prompt queue.
pub fn operator_channel(
    name: impl Into<String>,
    capacity: usize,
) -> (OperatorHandler, mpsc::Receiver<OperatorPrompt>) {
    let (outbox, inbox) = mpsc::channel(capacity.max(1));
    let handler = OperatorHandler {
        name: name.into(),
        outbox,
        extractor: ResponseExtractor::new(),
    };
    (handler, inbox)
}

#[async_trait]
impl ResourceHandler for OperatorHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &ResourceRequest) -> Result<ResourceResponse, HandlerError> {
        let prompt = match request.parameters.get("prompt").and_then(|v| v.as_str()) {
            Some(template) => request.render(template),
            None => request.render("Provide {target_attribute} for {entity_id}."),
        };
        let (reply, answer) = oneshot::channel();
        let pending = OperatorPrompt {
            entity_id: request.entity_id.clone(),
            target_attribute: request.target_attribute.clone(),
            prompt,
            reply,
        };
        self.outbox
            .send(pending)
            .await
            .map_err(|_| HandlerError::Unavailable("no operator attached".to_string()))?;
        let answer = answer
            .await
            .map_err(|_| HandlerError::Unavailable("operator abandoned the prompt".to_string()))?;
        self.extractor.extract(&answer)
    }
}
