use crate::error::IngestError;
use crate::ingest::cache::{ArtifactRow, CrossReferenceQuery, ObsInfoRow, RunPlaneRow};
use crate::ingest::caom::ObservationRecord;
use crate::ingest::repository::{
    AcquireOptions, Change, CommitOutcome, ObservationHandle, RepositoryClient,
};
use crate::ingest::uri::ObservationUri;
use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ETAG, IF_MATCH, IF_NONE_MATCH};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

/// Archive web service: observation documents plus cross-reference queries.
///
/// Observations live at `<base>/observations/<collection>/<id>` and are
/// versioned by `ETag`; writes carry `If-Match` so a concurrent change is
/// refused rather than overwritten.
#[derive(Debug, Clone)]
pub struct HttpArchive {
    base: Url,
    client: Client,
    raw_collection: String,
}

impl HttpArchive {
    pub fn new(
        base_url: &str,
        timeout_secs: u64,
        raw_collection: impl Into<String>,
    ) -> Result<Self> {
        let mut base =
            Url::parse(base_url).with_context(|| format!("invalid archive url `{base_url}`"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base,
            client,
            raw_collection: raw_collection.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("archive url `{}` cannot be a base", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn observation_url(&self, uri: &ObservationUri) -> Result<Url> {
        self.endpoint(&["observations", &uri.collection, &uri.observation_id])
    }

    fn get_rows<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = ensure_success(response, &url)?;
        response
            .json()
            .with_context(|| format!("invalid rows from {url}"))
    }

    fn send_versioned(
        &self,
        request: RequestBuilder,
        version: Option<&str>,
        uri: &ObservationUri,
        url: &Url,
    ) -> Result<()> {
        let request = match version {
            Some(tag) => request.header(IF_MATCH, tag),
            None => request.header(IF_NONE_MATCH, "*"),
        };
        let response = request
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            return Err(IngestError::reconciliation(
                uri.to_string(),
                "record changed in the archive since it was read",
            )
            .into());
        }
        ensure_success(response, url)?;
        Ok(())
    }
}

fn ensure_success(response: Response, url: &Url) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    anyhow::bail!("{url} answered {status}: {}", body.trim())
}

impl RepositoryClient for HttpArchive {
    fn acquire(&self, uri: &ObservationUri, options: AcquireOptions) -> Result<ObservationHandle> {
        let url = self.observation_url(uri)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        match response.status() {
            StatusCode::NOT_FOUND => ObservationHandle::new(uri.clone(), None, None, options, None),
            StatusCode::LOCKED => Err(IngestError::Locked {
                uri: uri.to_string(),
            }
            .into()),
            _ => {
                let response = ensure_success(response, &url)?;
                let version = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let record: ObservationRecord = response
                    .json()
                    .with_context(|| format!("invalid observation from {url}"))?;
                debug!(uri = %uri, version = ?version, "acquired");
                ObservationHandle::new(uri.clone(), Some(record), version, options, None)
            }
        }
    }

    fn commit(&self, handle: ObservationHandle) -> Result<CommitOutcome> {
        let url = self.observation_url(&handle.uri)?;
        match handle.change()? {
            Change::Nothing => Ok(CommitOutcome::Skipped),
            Change::Unchanged => Ok(CommitOutcome::Unchanged),
            Change::Delete => {
                self.send_versioned(
                    self.client.delete(url.clone()),
                    handle.version(),
                    &handle.uri,
                    &url,
                )?;
                info!(uri = %handle.uri, "removed observation");
                Ok(CommitOutcome::Deleted)
            }
            Change::Write(record) => {
                self.send_versioned(
                    self.client.put(url.clone()).json(record),
                    handle.version(),
                    &handle.uri,
                    &url,
                )?;
                Ok(CommitOutcome::Written)
            }
        }
    }
}

impl CrossReferenceQuery for HttpArchive {
    fn observation_info(&self, observation_id: &str) -> Result<Vec<ObsInfoRow>> {
        let url = self.endpoint(&["xref", "observation", &self.raw_collection, observation_id])?;
        self.get_rows(url)
    }

    fn planes_sharing_artifact(&self, artifact_uri: &str) -> Result<Vec<ArtifactRow>> {
        let mut url = self.endpoint(&["xref", "artifact"])?;
        url.query_pairs_mut().append_pair("uri", artifact_uri);
        self.get_rows(url)
    }

    fn planes_with_run_ids(
        &self,
        collection: &str,
        run_ids: &[String],
    ) -> Result<Vec<RunPlaneRow>> {
        let mut url = self.endpoint(&["xref", "runs", collection])?;
        {
            let mut pairs = url.query_pairs_mut();
            for run_id in run_ids {
                pairs.append_pair("run_id", run_id);
            }
        }
        self.get_rows(url)
    }
}
