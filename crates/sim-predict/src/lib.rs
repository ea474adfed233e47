//! Prediction client for the CTR, content engagement and feed ranking models.
//!
//! The [`Predictor`] trait is the raw contract; [`HttpPredictor`] talks JSON
//! over HTTP and [`FixedPredictor`] answers offline. [`PredictionClient`]
//! wraps either one and never surfaces a failure to the step engine.

pub mod client;
pub mod fixed;
pub mod http;
pub mod wire;

pub use client::PredictionClient;
pub use fixed::FixedPredictor;
pub use http::HttpPredictor;
pub use wire::{
    ContentPrediction, ContentRequest, CtrPrediction, CtrRequest, FeedPrediction, FeedRequest,
    RequestContext,
};

use sim_core::PredictionError;

/// A scoring backend. Errors are returned raw; see [`PredictionClient`].
#[allow(async_fn_in_trait)]
pub trait Predictor {
    async fn predict_ctr(&self, request: &CtrRequest) -> Result<CtrPrediction, PredictionError>;

    async fn predict_content(
        &self,
        request: &ContentRequest,
    ) -> Result<ContentPrediction, PredictionError>;

    async fn predict_feed(&self, request: &FeedRequest) -> Result<FeedPrediction, PredictionError>;
}
