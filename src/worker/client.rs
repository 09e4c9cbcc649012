//! HTTP client for the master's control API. Thin typed wrappers around
//! the endpoints the agent and the CLI use; errors carry the status and
//! body so failures are debuggable from a worker log alone.

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::domain::{Job, JobResult, Node, NodeRegistration};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized: check the api key")]
    Unauthorized,
    #[error("http {status}: {body}")]
    Status { status: StatusCode, body: String },
}

#[derive(Clone)]
pub struct MasterClient {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimResponse {
    job: Option<Job>,
}

#[derive(Debug, Deserialize)]
pub struct NodesResponse {
    pub count: usize,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Deserialize)]
pub struct JobsResponse {
    pub count: usize,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
pub struct ResultAckResponse {
    pub status: String,
}

impl MasterClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("invalid master url: {base_url}"))?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base,
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> anyhow::Result<reqwest::RequestBuilder> {
        let url = self.base.join(path).context("joining request path")?;
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        Ok(builder)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> anyhow::Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await.context("decoding response body")?);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ClientError::NotFound.into(),
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized.into(),
            _ => ClientError::Status { status, body }.into(),
        })
    }

    pub async fn health(&self) -> anyhow::Result<()> {
        let res = self.request(reqwest::Method::GET, "health")?.send().await?;
        let _: serde_json::Value = Self::read(res).await?;
        Ok(())
    }

    // Node surface.

    pub async fn register(&self, reg: &NodeRegistration) -> anyhow::Result<Node> {
        let res = self
            .request(reqwest::Method::POST, "nodes/register")?
            .json(reg)
            .send()
            .await?;
        // 201 on first contact, 200 on re-registration; both carry the node.
        Self::read(res).await
    }

    pub async fn heartbeat(&self, node_id: &str) -> anyhow::Result<()> {
        let res = self
            .request(reqwest::Method::POST, &format!("nodes/{node_id}/heartbeat"))?
            .send()
            .await?;
        let _: serde_json::Value = Self::read(res).await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> anyhow::Result<NodesResponse> {
        let res = self.request(reqwest::Method::GET, "nodes")?.send().await?;
        Self::read(res).await
    }

    pub async fn get_node(&self, node_id: &str) -> anyhow::Result<Node> {
        let res = self
            .request(reqwest::Method::GET, &format!("nodes/{node_id}"))?
            .send()
            .await?;
        Self::read(res).await
    }

    pub async fn remove_node(&self, node_id: &str) -> anyhow::Result<()> {
        let res = self
            .request(reqwest::Method::DELETE, &format!("nodes/{node_id}"))?
            .send()
            .await?;
        let _: serde_json::Value = Self::read(res).await?;
        Ok(())
    }

    // Job surface.

    pub async fn submit_job(&self, req: &crate::domain::JobRequest) -> anyhow::Result<Job> {
        let res = self
            .request(reqwest::Method::POST, "jobs")?
            .json(req)
            .send()
            .await?;
        Self::read(res).await
    }

    pub async fn list_jobs(&self) -> anyhow::Result<JobsResponse> {
        let res = self.request(reqwest::Method::GET, "jobs")?.send().await?;
        Self::read(res).await
    }

    pub async fn get_job(&self, selector: &str) -> anyhow::Result<Job> {
        let res = self
            .request(reqwest::Method::GET, &format!("jobs/{selector}"))?
            .send()
            .await?;
        Self::read(res).await
    }

    pub async fn job_logs(&self, selector: &str) -> anyhow::Result<String> {
        let res = self
            .request(reqwest::Method::GET, &format!("jobs/{selector}/logs"))?
            .send()
            .await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res.text().await?);
        }
        let body = res.text().await.unwrap_or_default();
        Err(ClientError::Status { status, body }.into())
    }

    pub async fn job_action(&self, selector: &str, action: &str) -> anyhow::Result<Job> {
        let res = self
            .request(reqwest::Method::POST, &format!("jobs/{selector}/{action}"))?
            .send()
            .await?;
        Self::read(res).await
    }

    /// The claim poll. `None` means nothing matched; poll again later.
    pub async fn next_job(&self, node_id: &str) -> anyhow::Result<Option<Job>> {
        let res = self
            .request(reqwest::Method::GET, &format!("jobs/next?node_id={node_id}"))?
            .send()
            .await?;
        let claim: ClaimResponse = Self::read(res).await?;
        Ok(claim.job)
    }

    /// Report progress; the returned row is the master's current view of
    /// the job, which is how a worker notices a cancellation.
    pub async fn report_progress(&self, job_id: &str, progress: u8) -> anyhow::Result<Job> {
        let res = self
            .request(reqwest::Method::POST, &format!("jobs/{job_id}/progress"))?
            .json(&serde_json::json!({ "progress": progress }))
            .send()
            .await?;
        Self::read(res).await
    }

    pub async fn submit_result(&self, result: &JobResult) -> anyhow::Result<ResultAckResponse> {
        let res = self
            .request(reqwest::Method::POST, "results")?
            .json(result)
            .send()
            .await?;
        Self::read(res).await
    }
}
