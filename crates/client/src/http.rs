use std::time::Duration;

use serde::de::DeserializeOwned;
use snafu::ResultExt;
use url::Url;

use crate::error::{
    BuildHttpClientSnafu, FetchResult, InvalidBaseUrlSnafu, MalformedBodySnafu, RequestSnafu,
    StatusSnafu,
};

/// REST base URL plus the shared HTTP client used by every REST collaborator.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    base: Url,
    http: reqwest::Client,
}

impl ApiEndpoint {
    pub fn new(base_url: &str, request_timeout: Duration) -> FetchResult<Self> {
        let trimmed = base_url.trim();
        // Url::join drops the last path segment unless the base ends with '/'.
        let normalized = if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        let base = Url::parse(&normalized).context(InvalidBaseUrlSnafu {
            stage: "parse-base-url",
            raw: base_url.to_string(),
        })?;

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self { base, http })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn url(&self, path: &str, stage: &'static str) -> FetchResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .context(InvalidBaseUrlSnafu {
                stage,
                raw: path.to_string(),
            })
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        path: &str,
    ) -> FetchResult<T> {
        let url = self.url(path, stage)?;
        let request = self.http.get(url.clone());
        self.send_json(stage, &url, request).await
    }

    /// Sends `request`, requires a 2xx status and decodes the body as `T`.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        url: &Url,
        request: reqwest::RequestBuilder,
    ) -> FetchResult<T> {
        let body = self.send_checked(stage, url, request).await?;
        serde_json::from_slice(&body).context(MalformedBodySnafu {
            stage,
            url: url.to_string(),
        })
    }

    /// Sends `request` and returns the raw body of a 2xx response.
    pub(crate) async fn send_checked(
        &self,
        stage: &'static str,
        url: &Url,
        request: reqwest::RequestBuilder,
    ) -> FetchResult<Vec<u8>> {
        let response = request.send().await.context(RequestSnafu {
            stage,
            url: url.to_string(),
        })?;

        let status = response.status();
        let body = response.bytes().await.context(RequestSnafu {
            stage,
            url: url.to_string(),
        })?;

        if !status.is_success() {
            return StatusSnafu {
                stage,
                url: url.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .fail();
        }

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_without_trailing_slash_keeps_its_path() {
        let endpoint = ApiEndpoint::new("http://localhost:5001/api", Duration::from_secs(1))
            .expect("endpoint");
        let url = endpoint
            .url("/sessions/4/messages", "test")
            .expect("joined url");
        assert_eq!(url.as_str(), "http://localhost:5001/api/sessions/4/messages");
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let error = ApiEndpoint::new("not a url", Duration::from_secs(1)).expect_err("invalid");
        assert!(matches!(error, crate::FetchError::InvalidBaseUrl { .. }));

        assert_eq!(
            error.to_string(),
            "invalid API base URL 'not a url' on `parse-base-url`: relative URL without a base"
        );
    }
}
