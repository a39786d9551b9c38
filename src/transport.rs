use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Method;

use crate::error::Failure;
use crate::request::{Body, FormBody, FormPart, Progress, ProgressFn, ResponseType};

const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Fully resolved request handed to a [`Transport`].
#[derive(Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub timeout: Duration,
    pub response_type: ResponseType,
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("response_type", &self.response_type)
            .finish()
    }
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Body::None,
            timeout: Duration::from_secs(30),
            response_type: ResponseType::Json,
            progress: None,
        }
    }

    /// Same request aimed at another URL.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// Raw response returned by a [`Transport`], any status.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Convenience constructor for a JSON body.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut response = Self::new(status, body.to_string());
        response.headers.insert(
            CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes a single HTTP exchange.
///
/// Non-success statuses are returned as responses; `Err` is reserved for
/// exchanges that produced no response at all.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<TransportResponse, Failure>>;
}

/// Default transport backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, Failure> {
        let TransportRequest {
            method,
            url,
            mut headers,
            body,
            timeout,
            response_type,
            progress,
        } = request;

        let builder = match body {
            Body::None => self.http.request(method, &url).headers(headers),
            Body::Json(value) => self.http.request(method, &url).headers(headers).json(&value),
            Body::Form(form) => {
                // multipart sets its own boundary-carrying content type
                headers.remove(CONTENT_TYPE);
                let form = build_form(form, progress.clone())?;
                self.http
                    .request(method, &url)
                    .headers(headers)
                    .multipart(form)
            }
        };

        let mut response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let body = match (response_type, progress) {
            (ResponseType::Binary, Some(progress)) => {
                let total = response.content_length();
                let mut buffer = BytesMut::new();
                while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
                    buffer.extend_from_slice(&chunk);
                    progress(Progress {
                        loaded: buffer.len() as u64,
                        total,
                    });
                }
                buffer.freeze()
            }
            _ => response.bytes().await.map_err(map_reqwest_error)?,
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<TransportResponse, Failure>> {
        Box::pin(self.execute(request))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> Failure {
    if err.is_timeout() {
        Failure::timeout(format!("request timed out: {err}"))
    } else if err.is_builder() || err.is_redirect() {
        Failure::Other(format!("request could not be sent: {err}"))
    } else {
        Failure::network(format!("network error: {err}"))
    }
}

fn build_form(form: FormBody, progress: Option<ProgressFn>) -> Result<Form, Failure> {
    let total: u64 = form
        .parts()
        .iter()
        .filter(|part| matches!(part, FormPart::File { .. }))
        .map(FormPart::len)
        .sum();
    let loaded = Arc::new(AtomicU64::new(0));

    let mut multipart = Form::new();
    for part in form.parts().iter().cloned() {
        match part {
            FormPart::Text { name, value } => multipart = multipart.text(name, value),
            FormPart::File {
                name,
                file_name,
                mime,
                content,
            } => {
                let len = content.len() as u64;
                let mut file = match &progress {
                    Some(callback) => Part::stream_with_length(
                        progress_body(content, loaded.clone(), total, callback.clone()),
                        len,
                    ),
                    None => Part::bytes(content.to_vec()),
                }
                .file_name(file_name);
                if let Some(mime) = mime {
                    file = file.mime_str(&mime).map_err(|err| {
                        Failure::Other(format!("invalid mime type '{mime}': {err}"))
                    })?;
                }
                multipart = multipart.part(name, file);
            }
        }
    }
    Ok(multipart)
}

fn progress_body(
    content: Bytes,
    loaded: Arc<AtomicU64>,
    total: u64,
    callback: ProgressFn,
) -> reqwest::Body {
    let chunks: Vec<Bytes> = (0..content.len())
        .step_by(UPLOAD_CHUNK_BYTES)
        .map(|start| content.slice(start..(start + UPLOAD_CHUNK_BYTES).min(content.len())))
        .collect();

    let stream = futures::stream::iter(chunks).map(move |chunk| {
        let size = chunk.len() as u64;
        let done = loaded.fetch_add(size, Ordering::Relaxed) + size;
        callback(Progress {
            loaded: done,
            total: Some(total),
        });
        Ok::<Bytes, std::io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
    use super::{TransportRequest, TransportResponse};
    use reqwest::Method;
    use serde_json::json;

    #[test]
    fn success_range() {
        assert!(TransportResponse::new(204, "").is_success());
        assert!(!TransportResponse::new(304, "").is_success());
        assert!(!TransportResponse::json(503, &json!({})).is_success());
    }

    #[test]
    fn with_url_keeps_everything_else() {
        let mut request = TransportRequest::new(Method::PUT, "https://api.test/a");
        request.body = json!({"x": 1}).into();
        let moved = request.with_url("https://relay.test/?u=a");
        assert_eq!(moved.method, Method::PUT);
        assert_eq!(moved.url, "https://relay.test/?u=a");
        assert_eq!(moved.body, request.body);
    }
}
