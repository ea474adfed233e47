//! JSON-over-HTTP predictor.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sim_core::{EndpointConfig, PredictionError};
use std::time::Duration;
use tracing::debug;

use crate::wire::{
    ContentPrediction, ContentRequest, CtrPrediction, CtrRequest, FeedPrediction, FeedRequest,
};
use crate::Predictor;

/// Posts requests to the configured scoring endpoints.
#[derive(Clone)]
pub struct HttpPredictor {
    client: Client,
    endpoints: EndpointConfig,
}

impl HttpPredictor {
    pub fn new(endpoints: EndpointConfig) -> Result<Self, PredictionError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(endpoints.timeout_ms))
            .build()
            .map_err(|e| PredictionError::Transport {
                model: "http",
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, endpoints })
    }

    async fn post<Req, Resp>(
        &self,
        model: &'static str,
        url: &str,
        request: &Req,
    ) -> Result<Resp, PredictionError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| PredictionError::Transport {
                model,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictionError::Status {
                model,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PredictionError::Transport {
                model,
                message: e.to_string(),
            })?;
        debug!(model, url, len = bytes.len(), "prediction response");
        serde_json::from_slice(&bytes).map_err(|e| PredictionError::Malformed {
            model,
            message: e.to_string(),
        })
    }
}

impl Predictor for HttpPredictor {
    async fn predict_ctr(&self, request: &CtrRequest) -> Result<CtrPrediction, PredictionError> {
        self.post(CtrPrediction::MODEL, &self.endpoints.ctr, request)
            .await
    }

    async fn predict_content(
        &self,
        request: &ContentRequest,
    ) -> Result<ContentPrediction, PredictionError> {
        self.post(ContentPrediction::MODEL, &self.endpoints.content, request)
            .await
    }

    async fn predict_feed(&self, request: &FeedRequest) -> Result<FeedPrediction, PredictionError> {
        self.post(FeedPrediction::MODEL, &self.endpoints.feed, request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::RequestContext;
    use chrono::Utc;
    use sim_core::{Ad, AdCategory, AdId, TargetMetrics, User};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one HTTP exchange with a canned status and body.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if request_complete(&buf) {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/predict")
    }

    fn request_complete(buf: &[u8]) -> bool {
        let text = String::from_utf8_lossy(buf);
        let Some(head_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..head_end]
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length")
                    .then(|| v.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        buf.len() >= head_end + 4 + length
    }

    fn predictor(ctr_url: String) -> HttpPredictor {
        HttpPredictor::new(EndpointConfig {
            ctr: ctr_url,
            timeout_ms: 2_000,
            ..EndpointConfig::default()
        })
        .unwrap()
    }

    fn ctr_request() -> CtrRequest {
        let user: User = serde_json::from_value(serde_json::json!({
            "id": "u1", "username": "u1", "age": 20, "region": "Europe",
            "device": "mobile", "persona_id": 1, "status": "active",
            "satisfaction": 0.5, "engagement_rate": 0.5, "network_density": 0.5,
            "influence_score": 1.0, "avg_scroll_depth": 0.5, "avg_watch_time": 10.0,
            "clicks_last_24h": 0, "content_interactions": 0, "video_views": 0,
            "video_completion_rate": 0.5, "follower_count": 0, "following_count": 0,
            "preferences": {}
        }))
        .unwrap();
        let ad = Ad {
            id: AdId::from("a1"),
            title: "t".into(),
            bid: rust_decimal::Decimal::ONE,
            budget: rust_decimal::Decimal::TEN,
            category: AdCategory::Travel,
            target: TargetMetrics::default(),
        };
        CtrRequest::new(&user, &ad, RequestContext::new(&user, Utc::now()).at_position(1))
    }

    #[tokio::test]
    async fn parses_success_body() {
        let url = serve_once("200 OK", r#"{"click_probability":0.12}"#).await;
        let p = predictor(url).predict_ctr(&ctr_request()).await.unwrap();
        assert_eq!(p.ctr, 0.12);
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        let err = predictor(url).predict_ctr(&ctr_request()).await.unwrap_err();
        assert_eq!(
            err,
            PredictionError::Status {
                model: "ctr",
                status: 503
            }
        );
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let url = serve_once("200 OK", "not json").await;
        let err = predictor(url).predict_ctr(&ctr_request()).await.unwrap_err();
        assert!(matches!(err, PredictionError::Malformed { model: "ctr", .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = predictor(format!("http://{addr}/predict"))
            .predict_ctr(&ctr_request())
            .await
            .unwrap_err();
        assert!(matches!(err, PredictionError::Transport { model: "ctr", .. }));
    }
}
