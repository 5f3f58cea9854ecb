use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::{
    semantic::{IngestItem, IngestReport, RankedResult, SearchTarget},
    web::{CreateIndexResponse, SearchResponse},
};

use super::{
    backend::{CreateOutcome, SearchBackend},
    errors::AppError,
};

/// Talks to a `folio serve` instance over HTTP.
pub struct RemoteBackend {
    remote_addr: String,
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl RemoteBackend {
    pub fn new(addr: &str, timeout: Duration) -> anyhow::Result<RemoteBackend, AppError> {
        let remote_addr = addr.strip_suffix("/").unwrap_or(addr).to_string();
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;

        Ok(RemoteBackend {
            remote_addr,
            client,
            timeout,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::blocking::RequestBuilder {
        log::debug!("{method} {}{}", self.remote_addr, url);
        self.client
            .request(method, format!("{}{}", self.remote_addr, url))
    }

    fn send(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> anyhow::Result<reqwest::blocking::Response, AppError> {
        builder.send().map_err(|err| {
            if err.is_timeout() {
                AppError::Timeout(self.timeout)
            } else {
                AppError::Reqwest(err)
            }
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum WebResponse<T> {
    Error { error: String },
    Data(T),
}

fn handle_response<T>(response: reqwest::blocking::Response) -> anyhow::Result<T, AppError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let text = response.text()?;

    let web_response = serde_json::from_str::<WebResponse<T>>(&text).map_err(|err| {
        log::error!("{err}. tried to parse: {text:?}");
        AppError::Remote(format!("unexpected response ({status}): {err}"))
    })?;

    match web_response {
        WebResponse::Data(data) if status.is_success() => Ok(data),
        WebResponse::Data(_) => Err(AppError::Remote(format!("unexpected status {status}"))),
        WebResponse::Error { error } => Err(match status {
            StatusCode::NOT_FOUND => AppError::NotFound(error),
            StatusCode::CONFLICT => AppError::AlreadyExists(error),
            _ => AppError::Remote(error),
        }),
    }
}

impl SearchBackend for RemoteBackend {
    fn create_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<CreateOutcome, AppError> {
        let resp = self.send(
            self.request(reqwest::Method::POST, "/api/create-index")
                .json(&json!({
                    "owner_id": owner_id,
                    "collection_id": collection_id,
                })),
        )?;

        match handle_response::<CreateIndexResponse>(resp) {
            Ok(resp) => Ok(resp.status),
            Err(AppError::AlreadyExists(_)) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    fn append_vectors(
        &self,
        owner_id: u64,
        collection_id: u64,
        items: &[IngestItem],
    ) -> anyhow::Result<IngestReport, AppError> {
        let resp = self.send(
            self.request(reqwest::Method::POST, "/api/embed-images")
                .json(&json!({
                    "owner_id": owner_id,
                    "collection_id": collection_id,
                    "images": items,
                })),
        )?;

        handle_response(resp)
    }

    fn search(
        &self,
        query: &str,
        top_k: usize,
        targets: &[SearchTarget],
    ) -> anyhow::Result<Vec<RankedResult>, AppError> {
        let resp = self.send(
            self.request(reqwest::Method::POST, "/api/search")
                .json(&json!({
                    "query": query,
                    "top_k": top_k,
                    "targets": targets,
                })),
        )?;

        Ok(handle_response::<SearchResponse>(resp)?.results)
    }

    fn delete_index(&self, owner_id: u64, collection_id: u64) -> anyhow::Result<(), AppError> {
        let resp = self.send(self.request(
            reqwest::Method::DELETE,
            &format!("/api/delete-index/{owner_id}/{collection_id}"),
        ))?;

        handle_response::<serde_json::Value>(resp)?;
        Ok(())
    }
}
