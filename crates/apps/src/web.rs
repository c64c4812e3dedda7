//! Remote job over HTTP.
//!
//! A [`WebApp`] submits a JSON payload, polls a status endpoint and fetches
//! the result once the job reports completion. Only URL templates and JSON
//! field names are configured; the protocol of any particular service is
//! left to the caller.

use appctl_core::{Application, Backoff};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::rules::RuleGuard;

/// Placeholder for the job id in URL templates.
pub const JOB_ID_PLACEHOLDER: &str = "{id}";

/// Errors raised by [`WebApp`].
#[derive(Debug, thiserror::Error)]
pub enum WebAppError {
    /// HTTP transport or status error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response did not have the expected shape
    #[error("Unexpected response: missing field `{0}`")]
    MissingField(String),

    /// A hook was called before the job was submitted
    #[error("Job has not been submitted")]
    NotSubmitted,

    /// The service reported the job as failed
    #[error("Remote job {id} failed with status `{status}`")]
    RemoteFailed {
        /// Remote job id
        id: String,
        /// Reported status
        status: String,
    },

    /// A request would have broken the service's spacing rule
    #[error("Request rule violated, {0:?} too early")]
    RuleViolation(Duration),
}

/// Endpoints and response fields of a remote job service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebAppSpec {
    /// POST target for new jobs
    pub submit_url: String,
    /// GET target reporting job status (may contain `{id}`)
    pub status_url: String,
    /// GET target returning the result (may contain `{id}`)
    pub result_url: String,
    /// DELETE target aborting a job (may contain `{id}`)
    pub cancel_url: Option<String>,
    /// Field of the submit response holding the job id
    pub id_field: String,
    /// Field of the status response holding the status
    pub status_field: String,
    /// Status values meaning the job is done
    pub finished_values: Vec<String>,
    /// Status values meaning the job failed
    pub failed_values: Vec<String>,
}

impl WebAppSpec {
    /// Spec with default field names and status values.
    pub fn new(
        submit_url: impl Into<String>,
        status_url: impl Into<String>,
        result_url: impl Into<String>,
    ) -> Self {
        Self {
            submit_url: submit_url.into(),
            status_url: status_url.into(),
            result_url: result_url.into(),
            cancel_url: None,
            id_field: "id".to_string(),
            status_field: "status".to_string(),
            finished_values: vec!["finished".into(), "completed".into(), "done".into()],
            failed_values: vec!["failed".into(), "error".into()],
        }
    }

    /// Set the cancel endpoint.
    pub fn with_cancel_url(mut self, url: impl Into<String>) -> Self {
        self.cancel_url = Some(url.into());
        self
    }

    /// Extract the job id from a submit response.
    pub fn job_id(&self, response: &Value) -> Result<String, WebAppError> {
        match response.get(&self.id_field) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(WebAppError::MissingField(self.id_field.clone())),
        }
    }

    /// Classify a status response.
    pub fn status(&self, response: &Value) -> Result<RemoteStatus, WebAppError> {
        let status = response
            .get(&self.status_field)
            .and_then(Value::as_str)
            .ok_or_else(|| WebAppError::MissingField(self.status_field.clone()))?;

        let matches = |values: &[String]| values.iter().any(|v| v.eq_ignore_ascii_case(status));
        Ok(if matches(&self.finished_values) {
            RemoteStatus::Finished
        } else if matches(&self.failed_values) {
            RemoteStatus::Failed(status.to_string())
        } else {
            RemoteStatus::Pending(status.to_string())
        })
    }
}

/// Status of a remote job as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Still queued or running
    Pending(String),
    /// Done, result available
    Finished,
    /// Failed remotely
    Failed(String),
}

/// Substitute the job id into a URL template.
pub fn render_url(template: &str, id: &str) -> String {
    template.replace(JOB_ID_PLACEHOLDER, id)
}

/// A job submitted to a remote HTTP service.
pub struct WebApp {
    client: reqwest::Client,
    spec: WebAppSpec,
    payload: Value,
    rules: RuleGuard,
    poll: Backoff,
    job_id: Option<String>,
    status: Option<RemoteStatus>,
}

impl WebApp {
    /// Create a job that submits `payload` to the service described by `spec`.
    pub fn new(spec: WebAppSpec, payload: Value) -> Self {
        Self {
            client: reqwest::Client::new(),
            spec,
            payload,
            rules: RuleGuard::default(),
            poll: Backoff::new(Duration::from_secs(1), 1.5, Duration::from_secs(30)),
            job_id: None,
            status: None,
        }
    }

    /// Use a preconfigured HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Set the request spacing rules.
    pub fn with_rules(mut self, rules: RuleGuard) -> Self {
        self.rules = rules;
        self
    }

    /// Set the poll cadence.
    pub fn poll_interval(mut self, poll: Backoff) -> Self {
        self.poll = poll;
        self
    }

    /// Remote job id, once submitted.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    fn url(&self, template: &str) -> Result<String, WebAppError> {
        let id = self.job_id.as_deref().ok_or(WebAppError::NotSubmitted)?;
        Ok(render_url(template, id))
    }

    async fn get_json(&mut self, url: &str) -> Result<Value, WebAppError> {
        self.rules.acquire().await?;
        let value = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl Application for WebApp {
    type Output = Value;

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        self.rules.acquire().await?;
        let response: Value = self
            .client
            .post(&self.spec.submit_url)
            .json(&self.payload)
            .send()
            .await
            .map_err(WebAppError::from)?
            .error_for_status()
            .map_err(WebAppError::from)?
            .json()
            .await
            .map_err(WebAppError::from)?;

        let id = self.spec.job_id(&response)?;
        info!("Submitted remote job {}", id);
        self.job_id = Some(id);
        Ok(())
    }

    async fn is_finished(&mut self) -> Result<bool, anyhow::Error> {
        let url = self.url(&self.spec.status_url)?;
        let response = self.get_json(&url).await?;
        let status = self.spec.status(&response)?;
        debug!("Remote job status: {:?}", status);

        let done = !matches!(status, RemoteStatus::Pending(_));
        self.status = Some(status);
        Ok(done)
    }

    fn wait_interval(&mut self) -> Duration {
        self.poll.next()
    }

    async fn evaluate(&mut self) -> Result<Value, anyhow::Error> {
        if let Some(RemoteStatus::Failed(status)) = &self.status {
            return Err(WebAppError::RemoteFailed {
                id: self.job_id.clone().unwrap_or_default(),
                status: status.clone(),
            }
            .into());
        }

        let url = self.url(&self.spec.result_url)?;
        Ok(self.get_json(&url).await?)
    }

    async fn clean_up(&mut self) {
        let finished = matches!(
            self.status,
            Some(RemoteStatus::Finished | RemoteStatus::Failed(_))
        );
        let Some(template) = self.spec.cancel_url.clone() else {
            return;
        };
        if finished || self.job_id.is_none() {
            return;
        }

        let url = match self.url(&template) {
            Ok(url) => url,
            Err(_) => return,
        };
        if let Err(e) = self.rules.acquire().await {
            warn!("Skipping remote cancel: {}", e);
            return;
        }
        match self.client.delete(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Cancelled remote job at {}", url)
            }
            Ok(response) => warn!("Remote cancel returned {}", response.status()),
            Err(e) => warn!("Remote cancel failed: {}", e),
        }
    }

    fn name(&self) -> &str {
        &self.spec.submit_url
    }
}
