use pulse_core::pipeline::AgentLogEntry;
use pulse_core::schedule::{CampaignScheduleOverview, PostSchedule};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}) for {url}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    #[error("api base {0} cannot carry a path")]
    Url(String),
}

/// Read-only REST access used to seed local state before live events arrive.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    base: Url,
    http: reqwest::Client,
}

impl SnapshotClient {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    pub async fn campaign_schedules(&self, campaign_id: &str) -> Result<Vec<PostSchedule>, SnapshotError> {
        self.get(&["api", "schedules", "campaigns", campaign_id, "posts"]).await
    }

    pub async fn post_schedule(&self, post_id: &str) -> Result<PostSchedule, SnapshotError> {
        self.get(&["api", "schedules", "posts", post_id]).await
    }

    pub async fn campaign_overview(
        &self,
        campaign_id: &str,
    ) -> Result<CampaignScheduleOverview, SnapshotError> {
        self.get(&["api", "schedules", "campaigns", campaign_id, "overview"]).await
    }

    pub async fn agent_logs(&self, post_id: &str) -> Result<Vec<AgentLogEntry>, SnapshotError> {
        self.get(&["api", "pipeline", "posts", post_id, "logs"]).await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SnapshotError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SnapshotError::Url(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, SnapshotError> {
        let url = self.endpoint(segments)?;
        debug!(event = "snapshot_request", url = %url);
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SnapshotError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}
