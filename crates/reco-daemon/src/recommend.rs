//! Remote recommendation and feedback service.
//!
//! The controller must always get a usable track back, so transport failures
//! degrade to a local placeholder instead of surfacing as errors.  Feedback is
//! advisory: failures come back in the receipt.

use std::time::Duration;

use async_trait::async_trait;
use reco_proto::config::RecommenderConfig;
use reco_proto::protocol::Algorithm;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub song_title: String,
    pub algorithm: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub score_computed: Option<f64>,
}

impl FeedbackReceipt {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
            score_computed: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackRequest<'a> {
    user_id: &'a str,
    music_id: &'a str,
    listening_time: u64,
}

#[derive(Deserialize)]
struct Health {
    status: String,
}

#[async_trait]
pub trait RecommendationClient: Send + Sync {
    /// Next track for `user_id`.  `Err` only when no placeholder could be
    /// produced either.
    async fn recommend(&self, user_id: &str, algorithm: Algorithm)
        -> anyhow::Result<Recommendation>;

    async fn send_feedback(&self, user_id: &str, track_id: &str, seconds: u64) -> FeedbackReceipt;
}

/// Placeholder served when the service is unreachable or mock mode is on.
pub fn placeholder(algorithm: Algorithm) -> Recommendation {
    let song_title = match algorithm {
        Algorithm::Collaborative => "Bohemian Rhapsody - Queen",
        Algorithm::ContentBased => "Stairway to Heaven - Led Zeppelin",
        Algorithm::Hybrid => "Hotel California - Eagles",
    };
    Recommendation {
        song_title: song_title.to_string(),
        algorithm: format!("{}_mock", algorithm.wire_name()),
        status: "success".to_string(),
    }
}

pub struct HttpRecommender {
    client: reqwest::Client,
    base_url: String,
    use_mock: bool,
    retries: u32,
}

impl HttpRecommender {
    pub fn new(config: &RecommenderConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            use_mock: config.use_mock,
            retries: config.retries,
        })
    }

    /// True when the service answers `{"status": "healthy"}`.
    pub async fn health(&self) -> bool {
        if self.use_mock {
            return false;
        }
        let url = format!("{}/health", self.base_url);
        let result = async {
            let resp = self.client.get(&url).send().await?.error_for_status()?;
            resp.json::<Health>().await
        }
        .await;

        match result {
            Ok(health) => health.status == "healthy",
            Err(e) => {
                debug!("recommender: health check failed: {}", e);
                false
            }
        }
    }

    async fn fetch(&self, user_id: &str, algorithm: Algorithm) -> reqwest::Result<Recommendation> {
        let url = format!("{}/recommend/next", self.base_url);
        self.client
            .get(&url)
            .query(&[("userId", user_id), ("algoType", algorithm.wire_name())])
            .send()
            .await?
            .error_for_status()?
            .json::<Recommendation>()
            .await
    }
}

#[async_trait]
impl RecommendationClient for HttpRecommender {
    async fn recommend(
        &self,
        user_id: &str,
        algorithm: Algorithm,
    ) -> anyhow::Result<Recommendation> {
        if self.use_mock {
            info!("recommender: mock mode, serving placeholder");
            return Ok(placeholder(algorithm));
        }

        let attempts = self.retries + 1;
        for attempt in 1..=attempts {
            match self.fetch(user_id, algorithm).await {
                Ok(rec) if !rec.song_title.trim().is_empty() => {
                    info!(
                        "recommender: {:?} ({}, {})",
                        rec.song_title, rec.algorithm, rec.status
                    );
                    return Ok(rec);
                }
                Ok(_) => warn!(
                    "recommender: empty title (attempt {}/{})",
                    attempt, attempts
                ),
                Err(e) => warn!(
                    "recommender: request failed (attempt {}/{}): {}",
                    attempt, attempts, e
                ),
            }
        }

        warn!("recommender: service unavailable, falling back to placeholder");
        Ok(placeholder(algorithm))
    }

    async fn send_feedback(&self, user_id: &str, track_id: &str, seconds: u64) -> FeedbackReceipt {
        if self.use_mock {
            debug!(
                "recommender: mock mode, feedback not sent ({} / {}s)",
                track_id, seconds
            );
            return FeedbackReceipt {
                status: "success".to_string(),
                message: Some("Mock feedback (not sent)".to_string()),
                score_computed: None,
            };
        }

        let url = format!("{}/feedback/update", self.base_url);
        let body = FeedbackRequest {
            user_id,
            music_id: track_id,
            listening_time: seconds,
        };
        let result = async {
            self.client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json::<FeedbackReceipt>()
                .await
        }
        .await;

        match result {
            Ok(receipt) => {
                info!(
                    "recommender: feedback for {:?} ({}s): {}",
                    track_id, seconds, receipt.status
                );
                receipt
            }
            Err(e) => {
                warn!("recommender: feedback failed: {}", e);
                FeedbackReceipt::error(format!("Failed to send feedback: {}", e))
            }
        }
    }
}
