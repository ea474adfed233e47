//! Offline predictor returning constant answers.

use sim_core::PredictionError;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::wire::{
    ContentPrediction, ContentRequest, CtrPrediction, CtrRequest, FeedPrediction, FeedRequest,
};
use crate::Predictor;

/// Answers every request with the same predictions, or the same error.
///
/// Used by `run --offline` and by tests that need deterministic scores.
#[derive(Debug)]
pub struct FixedPredictor {
    pub ctr: CtrPrediction,
    pub content: ContentPrediction,
    pub feed: FeedPrediction,
    failure: Option<PredictionError>,
    calls: AtomicU64,
}

impl Default for FixedPredictor {
    fn default() -> Self {
        Self::new(
            CtrPrediction::DEFAULT,
            ContentPrediction::DEFAULT,
            FeedPrediction::DEFAULT,
        )
    }
}

impl FixedPredictor {
    pub fn new(ctr: CtrPrediction, content: ContentPrediction, feed: FeedPrediction) -> Self {
        Self {
            ctr,
            content,
            feed,
            failure: None,
            calls: AtomicU64::new(0),
        }
    }

    /// A predictor whose service is never reachable.
    pub fn unreachable() -> Self {
        Self {
            failure: Some(PredictionError::Transport {
                model: "fixed",
                message: "connection refused".into(),
            }),
            ..Self::default()
        }
    }

    /// Requests answered so far, successful or not.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn answer<T: Copy>(&self, value: T) -> Result<T, PredictionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(value),
        }
    }
}

impl Predictor for FixedPredictor {
    async fn predict_ctr(&self, _: &CtrRequest) -> Result<CtrPrediction, PredictionError> {
        self.answer(self.ctr)
    }

    async fn predict_content(&self, _: &ContentRequest) -> Result<ContentPrediction, PredictionError> {
        self.answer(self.content)
    }

    async fn predict_feed(&self, _: &FeedRequest) -> Result<FeedPrediction, PredictionError> {
        self.answer(self.feed)
    }
}
