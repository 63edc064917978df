use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::types::{Classification, ClassifyRequest, ModelOutcome, ReplyRequest};
use super::{METHOD_API_UNAVAILABLE, ModelApi};

/// Scripted model API. Queued outcomes are returned in order; an empty
/// queue degrades the same way an unreachable service would.
#[derive(Debug, Default, Clone)]
pub struct MockModelApi {
    classifications: Arc<Mutex<VecDeque<ModelOutcome<Classification>>>>,
    replies: Arc<Mutex<VecDeque<ModelOutcome<String>>>>,
    classify_requests: Arc<Mutex<Vec<ClassifyRequest>>>,
    reply_requests: Arc<Mutex<Vec<ReplyRequest>>>,
    classify_calls: Arc<AtomicUsize>,
    reply_calls: Arc<AtomicUsize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockModelApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_classification(&self, outcome: ModelOutcome<Classification>) {
        lock(&self.classifications).push_back(outcome);
    }

    /// Queue a successful classification with the given raw label.
    pub fn enqueue_label(&self, label: &str, confidence: f64) {
        self.enqueue_classification(ModelOutcome::Ok(Classification {
            label: label.to_string(),
            confidence,
            method: "mock".to_string(),
            ..Classification::fallback("mock")
        }));
    }

    pub fn enqueue_reply(&self, outcome: ModelOutcome<String>) {
        lock(&self.replies).push_back(outcome);
    }

    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn reply_calls(&self) -> usize {
        self.reply_calls.load(Ordering::SeqCst)
    }

    pub fn classify_requests(&self) -> Vec<ClassifyRequest> {
        lock(&self.classify_requests).clone()
    }

    pub fn reply_requests(&self) -> Vec<ReplyRequest> {
        lock(&self.reply_requests).clone()
    }
}

#[async_trait]
impl ModelApi for MockModelApi {
    async fn classify(&self, request: ClassifyRequest) -> ModelOutcome<Classification> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.classify_requests).push(request);
        lock(&self.classifications).pop_front().unwrap_or_else(|| {
            ModelOutcome::degraded(
                Classification::fallback(METHOD_API_UNAVAILABLE),
                "mock response not provided",
            )
        })
    }

    async fn generate_reply(&self, request: ReplyRequest) -> ModelOutcome<String> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.reply_requests).push(request);
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| ModelOutcome::degraded(String::new(), "mock response not provided"))
    }
}
