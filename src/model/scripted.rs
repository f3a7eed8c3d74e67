//! In-process model double with scripted replies.
//!
//! Replies are queued per [`CallPurpose`]; the last queued reply repeats once
//! the queue is down to one entry. A responder closure can replace the queues
//! when replies depend on the request (for example on the page number).

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{CallPurpose, ModelCallError, ModelClient, ModelRequest};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Raw model text
    Text(String),
    /// Transport-level failure
    Fail(String),
    /// Never answers; only a timeout ends the call
    Hang,
}

/// A call the double received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub purpose: CallPurpose,
    pub system: String,
    pub user: String,
    pub images: Vec<Vec<u8>>,
}

type Responder = dyn Fn(&ModelRequest<'_>) -> ScriptedReply + Send + Sync;

pub struct ScriptedModel {
    queues: Mutex<HashMap<CallPurpose, VecDeque<ScriptedReply>>>,
    responder: Option<Box<Responder>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the closure's reply
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest<'_>) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub fn reply(self, purpose: CallPurpose, text: impl Into<String>) -> Self {
        self.push(purpose, ScriptedReply::Text(text.into()))
    }

    pub fn push(self, purpose: CallPurpose, reply: ScriptedReply) -> Self {
        lock(&self.queues)
            .entry(purpose)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, purpose: CallPurpose) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.purpose == purpose)
            .count()
    }

    fn next_reply(&self, request: &ModelRequest<'_>) -> ScriptedReply {
        if let Some(responder) = &self.responder {
            return responder(request);
        }

        let mut queues = lock(&self.queues);
        match queues.get_mut(&request.purpose) {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| ScriptedReply::Fail("empty queue".to_string())),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| ScriptedReply::Fail("empty queue".to_string())),
            None => ScriptedReply::Fail(format!(
                "no scripted reply for {} calls",
                request.purpose.as_str()
            )),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest<'_>) -> Result<String, ModelCallError> {
        lock(&self.calls).push(RecordedCall {
            purpose: request.purpose,
            system: request.system.to_string(),
            user: request.user.clone(),
            images: request.images.iter().map(|png| png.to_vec()).collect(),
        });

        match self.next_reply(request) {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(reason) => Err(ModelCallError::Transport(reason)),
            ScriptedReply::Hang => {
                std::future::pending::<()>().await;
                Err(ModelCallError::EmptyResponse)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(purpose: CallPurpose) -> ModelRequest<'static> {
        ModelRequest {
            purpose,
            system: "s",
            user: "u".to_string(),
            images: vec![],
        }
    }

    #[tokio::test]
    async fn last_reply_repeats() {
        let model = ScriptedModel::new()
            .reply(CallPurpose::Convert, "one")
            .reply(CallPurpose::Convert, "two");
        let req = request(CallPurpose::Convert);
        assert_eq!(model.complete(&req).await.unwrap(), "one");
        assert_eq!(model.complete(&req).await.unwrap(), "two");
        assert_eq!(model.complete(&req).await.unwrap(), "two");
        assert_eq!(model.calls_for(CallPurpose::Convert), 3);
    }

    #[tokio::test]
    async fn unscripted_purpose_fails() {
        let model = ScriptedModel::new();
        let err = model.complete(&request(CallPurpose::Extract)).await.unwrap_err();
        assert!(err.to_string().contains("extract"));
    }

    #[tokio::test]
    async fn responder_sees_request() {
        let model = ScriptedModel::from_fn(|req| ScriptedReply::Text(req.user.to_uppercase()));
        assert_eq!(model.complete(&request(CallPurpose::Extract)).await.unwrap(), "U");
    }
}
