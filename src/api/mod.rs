//! API Client Module
//!
//! Sends authenticated requests to the application's REST API. Every
//! request carries a bearer token from the session; a 401 is retried
//! exactly once with a freshly acquired token.

mod http;

pub use http::ReqwestBackend;

use std::collections::BTreeMap;
use std::sync::Arc;
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

const UNAUTHORIZED: u16 = 401;

/// Supplies bearer tokens for outgoing requests
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// A current access token, or `None` if none can be had silently
    async fn access_token(&self) -> Option<String>;
}

/// A request relative to the API base URL
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Attach `Authorization: Bearer <token>`
    pub add_auth_header: bool,
    /// Retry once on 401
    pub intercept_401: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            add_auth_header: true,
            intercept_401: true,
        }
    }

    /// Attach a JSON body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send without a bearer token
    pub fn anonymous(mut self) -> Self {
        self.add_auth_header = false;
        self
    }

    /// Surface a 401 without retrying
    pub fn without_retry(mut self) -> Self {
        self.intercept_401 = false;
        self
    }
}

/// A received response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Decode the body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Pagination headers, when the endpoint pages its results
    pub fn pagination(&self) -> PaginationInfo {
        PaginationInfo::from_response(self)
    }
}

/// Paging information sent in `x-pagination-*` headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub total_pages: Option<u64>,
    pub total_records: Option<u64>,
    pub page_number: Option<u64>,
}

impl PaginationInfo {
    pub fn from_response(response: &ApiResponse) -> Self {
        let read = |name: &str| response.header(name).and_then(|v| v.trim().parse().ok());
        Self {
            total_pages: read("x-pagination-totalpages"),
            total_records: read("x-pagination-totalrecords"),
            page_number: read("x-pagination-pagenumber"),
        }
    }
}

/// Performs one HTTP exchange
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Send `request`, with the bearer token if one is given
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse>;
}

/// Authenticated API client
pub struct ApiService {
    backend: Arc<dyn HttpBackend>,
    tokens: Arc<dyn AccessTokenSource>,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl ApiService {
    pub fn new(backend: Arc<dyn HttpBackend>, tokens: Arc<dyn AccessTokenSource>) -> Self {
        Self {
            backend,
            tokens,
            telemetry: None,
        }
    }

    /// Report failed requests
    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::GET, path)).await
    }

    pub async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::POST, path).with_body(serde_json::to_value(body)?))
            .await
    }

    pub async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::PUT, path).with_body(serde_json::to_value(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(ApiRequest::new(Method::DELETE, path)).await
    }

    /// Send a request, retrying once with a fresh token on 401
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let result = self.send_with_retry(&request).await;
        if let Err(e) = &result {
            if e.is_unauthorized() {
                tracing::warn!("Token rejected for {} {}", request.method, request.path);
            }
            if let Some(telemetry) = &self.telemetry {
                telemetry.track_exception(&format!("{} {}", request.method, request.path), e);
            }
        }
        result
    }

    async fn send_with_retry(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let max_attempts = if request.intercept_401 { 2 } else { 1 };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let token = if request.add_auth_header {
                self.tokens.access_token().await
            } else {
                None
            };

            let response = self.backend.execute(request, token.as_deref()).await?;
            if response.status == UNAUTHORIZED {
                if attempts < max_attempts {
                    tracing::debug!("{} {} returned 401, retrying with a fresh token", request.method, request.path);
                    continue;
                }
                return Err(Error::Unauthorized {
                    method: request.method.to_string(),
                    path: request.path.clone(),
                    attempts,
                });
            }

            if !response.is_success() {
                return Err(Error::Api {
                    method: request.method.to_string(),
                    path: request.path.clone(),
                    status: response.status,
                });
            }

            return Ok(response);
        }
    }
}
