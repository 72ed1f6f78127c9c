use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use url::Url;

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn is_idempotent_read(self) -> bool {
        self == Method::Get
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// A fully prepared outbound call, handed to the dispatcher by the gateway's
/// drain task.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpCall {
    pub method: Method,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
}

/// Raw outcome of a call that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Wire seam of the gateway. Implementations return `Err` only for
/// transport-level failures; any status the server answered with is an
/// `Ok(HttpReply)`.
#[async_trait]
pub trait HttpDispatcher: Send + Sync {
    async fn dispatch(&self, call: HttpCall) -> Result<HttpReply, RequestError>;
}

pub struct ReqwestDispatcher {
    http: Client,
    base_url: Url,
}

impl ReqwestDispatcher {
    pub fn new(base_url: &str, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, RequestError> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|err| RequestError::network(format!("invalid endpoint {endpoint}: {err}")))
    }
}

#[async_trait]
impl HttpDispatcher for ReqwestDispatcher {
    async fn dispatch(&self, call: HttpCall) -> Result<HttpReply, RequestError> {
        let url = self.endpoint_url(&call.endpoint)?;
        let method = match call.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut request = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        if let Some(token) = &call.bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RequestError::network(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| RequestError::network(format!("failed to read response body: {err}")))?;
        Ok(HttpReply { status, body })
    }
}
