//! The seam where a prepared `HttpRequest` becomes network I/O.
//!
//! # Design
//! Everything above this trait works on plain data. `ReqwestTransport` is the
//! production implementation; tests substitute a scripted fake. A transport
//! returns every HTTP status as data and only fails with
//! [`ApiError::Network`] when no response arrived at all.

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute `request` once. Non-2xx statuses are returned as `Ok`.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

#[cfg(feature = "reqwest")]
pub use reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use async_trait::async_trait;
    use reqwest::multipart::{Form, Part};
    use reqwest::{Client, Method};
    use tracing::debug;

    use crate::config::ClientConfig;
    use crate::error::{ApiError, Result};
    use crate::http::{FormPart, FormValue, HttpMethod, HttpRequest, HttpResponse, RequestBody};

    use super::Transport;

    /// `reqwest`-backed transport. Keeps a cookie store so the HttpOnly
    /// refresh cookie set by the auth endpoints is replayed automatically.
    #[derive(Debug, Clone)]
    pub struct ReqwestTransport {
        client: Client,
    }

    impl ReqwestTransport {
        /// # Errors
        ///
        /// Returns [`ApiError::Config`] if the underlying client cannot be built.
        pub fn new(config: &ClientConfig) -> Result<Self> {
            let mut builder = Client::builder()
                .cookie_store(true)
                .timeout(config.timeout());
            if let Some(agent) = &config.user_agent {
                builder = builder.user_agent(agent.clone());
            }
            let client = builder
                .build()
                .map_err(|e| ApiError::Config(e.to_string()))?;
            Ok(Self { client })
        }

        pub fn with_client(client: Client) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            let mut builder = self
                .client
                .request(method(request.method), &request.path)
                .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = match &request.body {
                None => builder,
                Some(RequestBody::Json(payload)) => {
                    let bytes = serde_json::to_vec(payload)
                        .map_err(|e| ApiError::Serialization(e.to_string()))?;
                    builder
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(bytes)
                }
                Some(RequestBody::Multipart(parts)) => builder.multipart(form(parts)?),
            };

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = response.text().await?;
            debug!(status, path = %request.path, "response received");

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    /// Rebuilt on every send: `Form` is single-use, and a replayed upload
    /// needs a fresh one.
    fn form(parts: &[FormPart]) -> Result<Form> {
        let mut form = Form::new();
        for part in parts {
            form = match &part.value {
                FormValue::Text(text) => form.text(part.name.clone(), text.clone()),
                FormValue::File(file) => {
                    let mut body = Part::bytes(file.bytes.to_vec());
                    if let Some(name) = &file.file_name {
                        body = body.file_name(name.clone());
                    }
                    if let Some(content_type) = &file.content_type {
                        body = body
                            .mime_str(content_type)
                            .map_err(|e| ApiError::Serialization(e.to_string()))?;
                    }
                    form.part(part.name.clone(), body)
                }
            };
        }
        Ok(form)
    }
}
