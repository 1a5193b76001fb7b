use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

use crate::domain::{ConfigRequest, MvmRequest, RequestId, Stage, StatusReport};
use crate::error::HobsError;
use crate::settings::Settings;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const CONCAT_TABLES_TIMEOUT: Duration = Duration::from_secs(3600);

pub trait HobsClient: Send + Sync {
    fn submit_configs(&self, request: &ConfigRequest) -> Result<RequestId, HobsError>;
    fn submit_mvm(&self, request: &MvmRequest) -> Result<RequestId, HobsError>;
    fn status(&self, id: &RequestId) -> Result<StatusReport, HobsError>;
    fn result_url(&self, id: &RequestId) -> Result<String, HobsError>;
    /// Downloads a result archive from a URL returned by `result_url`.
    fn download(&self, url: &str) -> Result<Vec<u8>, HobsError>;
    /// Bulk export of every HOBS table for one stage, as a zip of CSVs.
    fn concat_tables(&self, stage: &Stage) -> Result<Vec<u8>, HobsError>;
    fn hobs_table(&self) -> Result<Vec<u8>, HobsError>;
}

#[derive(Clone)]
pub struct HobsHttpClient {
    client: Client,
    base_url: String,
    requester: String,
    download_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: String,
}

impl HobsHttpClient {
    pub fn new(settings: &Settings) -> Result<Self, HobsError> {
        Self::with_base_url(
            &settings.hobs_url,
            &settings.user_email,
            settings.download_timeout,
        )
    }

    pub fn with_base_url(
        base_url: &str,
        requester: &str,
        download_timeout: Duration,
    ) -> Result<Self, HobsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("hobs-toolkit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HobsError::UnexpectedResponse(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|source| HobsError::Http {
                context: "building HTTP client".to_string(),
                source,
            })?;
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        Ok(Self {
            client,
            base_url,
            requester: requester.to_string(),
            download_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn send(&self, context: &str, request: RequestBuilder) -> Result<Response, HobsError> {
        let response = request
            .query(&[("requester", self.requester.as_str())])
            .send()
            .map_err(|source| HobsError::Http {
                context: context.to_string(),
                source,
            })?;
        Self::handle_status(response)
    }

    fn handle_status(response: Response) -> Result<Response, HobsError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "HOBS request failed".to_string());
        Err(HobsError::Status { status, message })
    }

    fn read_json(context: &str, response: Response) -> Result<Value, HobsError> {
        response.json().map_err(|source| HobsError::Http {
            context: context.to_string(),
            source,
        })
    }

    fn read_bytes(context: &str, response: Response) -> Result<Vec<u8>, HobsError> {
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|source| HobsError::Http {
                context: context.to_string(),
                source,
            })
    }

    fn submit<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<RequestId, HobsError> {
        let context = format!("submitting {path}");
        let response = self.send(&context, self.client.post(self.url(path)).json(body))?;
        let payload: SubmitResponse = response
            .json()
            .map_err(|source| HobsError::Http { context, source })?;
        payload.request_id.parse()
    }
}

impl HobsClient for HobsHttpClient {
    fn submit_configs(&self, request: &ConfigRequest) -> Result<RequestId, HobsError> {
        self.submit("api/configs", request)
    }

    fn submit_mvm(&self, request: &MvmRequest) -> Result<RequestId, HobsError> {
        self.submit("api/measured-vs-modeled", request)
    }

    fn status(&self, id: &RequestId) -> Result<StatusReport, HobsError> {
        let context = format!("checking status of {id}");
        let url = self.url(&format!("api/requests/{}/status", id.as_str()));
        let response = self.send(&context, self.client.get(url))?;
        StatusReport::from_json(Self::read_json(&context, response)?)
    }

    fn result_url(&self, id: &RequestId) -> Result<String, HobsError> {
        let context = format!("resolving result url of {id}");
        let url = self.url(&format!("api/requests/{}/result-url", id.as_str()));
        let response = self.send(&context, self.client.get(url))?;
        parse_result_url(&Self::read_json(&context, response)?)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, HobsError> {
        let context = "downloading result archive";
        let response = self
            .client
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .map_err(|source| HobsError::Http {
                context: context.to_string(),
                source,
            })?;
        Self::read_bytes(context, Self::handle_status(response)?)
    }

    fn concat_tables(&self, stage: &Stage) -> Result<Vec<u8>, HobsError> {
        let context = format!("exporting concatenated tables for stage {stage}");
        let request = self
            .client
            .get(self.url("debug/concat-tables"))
            .query(&[("stage", stage.as_str())])
            .timeout(CONCAT_TABLES_TIMEOUT);
        let response = self.send(&context, request)?;
        Self::read_bytes(&context, response)
    }

    fn hobs_table(&self) -> Result<Vec<u8>, HobsError> {
        let context = "downloading HOBS table";
        let response = self.send(context, self.client.get(self.url("api/hobs-table")))?;
        Self::read_bytes(context, response)
    }
}

/// Accepts a bare JSON string or an object with `url`/`result_url`.
pub fn parse_result_url(payload: &Value) -> Result<String, HobsError> {
    let url = match payload {
        Value::String(url) => Some(url.as_str()),
        Value::Object(map) => ["result_url", "url"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|value| value.as_str())),
        _ => None,
    };
    url.map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| HobsError::UnexpectedResponse(format!("no result url in {payload}")))
}
