//! REST client for the Kubernetes API server.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use super::{ClusterApi, KubeError, ObjectList, Patch, ResourceKind, WatchEvent, WatchStream};
use crate::config::KubeConfig;

/// Timeout for everything except watches.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Kubernetes API client.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Create a client for `base_url`.
    ///
    /// `ca_pem` adds a trusted root for clusters with a private CA.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build a client from in-cluster service account files.
    pub fn from_config(config: &KubeConfig) -> Result<Self, KubeError> {
        let token = std::fs::read_to_string(&config.token_path)
            .map(|t| t.trim().to_string())
            .map_err(|e| {
                KubeError::Config(format!("reading token {}: {}", config.token_path, e))
            })?;
        let ca = std::fs::read(&config.ca_path)
            .map_err(|e| KubeError::Config(format!("reading CA {}: {}", config.ca_path, e)))?;

        Self::new(&config.api_url, Some(token), Some(&ca))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, KubeError> {
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(api_error(response).await)
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> Result<Value, KubeError> {
        let response = self.send(builder.timeout(REQUEST_TIMEOUT)).await?;
        Ok(response.json().await?)
    }
}

/// Turn a failed response into [`KubeError::Api`] using the Status body.
async fn api_error(response: Response) -> KubeError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

    KubeError::Api {
        status,
        reason: parsed["reason"].as_str().unwrap_or_default().to_string(),
        message: parsed["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(body),
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, KubeError> {
        let path = kind.path(namespace, Some(name));
        match self.send_json(self.request(Method::GET, &path)).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, KubeError> {
        let path = kind.path(namespace, None);
        debug!(kind = %kind, path = %path, "creating object");
        self.send_json(self.request(Method::POST, &path).json(object))
            .await
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> Result<Value, KubeError> {
        let path = kind.path(namespace, Some(name));
        debug!(kind = %kind, path = %path, "patching object");
        let body = serde_json::to_vec(patch.body())?;
        self.send_json(
            self.request(Method::PATCH, &path)
                .header(reqwest::header::CONTENT_TYPE, patch.content_type())
                .body(body),
        )
        .await
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, KubeError> {
        let path = kind.path(namespace, Some(name));
        debug!(kind = %kind, path = %path, "deleting object");
        match self
            .send_json(
                self.request(Method::DELETE, &path)
                    .query(&[("propagationPolicy", "Background")]),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<(), KubeError> {
        let path = kind.path(Some(namespace), None);
        debug!(kind = %kind, path = %path, selector, "deleting collection");
        match self
            .send_json(
                self.request(Method::DELETE, &path)
                    .query(&[("labelSelector", selector)]),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<ObjectList, KubeError> {
        let path = kind.path(namespace, None);
        let mut builder = self.request(Method::GET, &path);
        if let Some(selector) = selector {
            builder = builder.query(&[("labelSelector", selector)]);
        }

        let mut body = self.send_json(builder).await?;
        let items = match body["items"].take() {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        Ok(ObjectList {
            resource_version: body["metadata"]["resourceVersion"]
                .as_str()
                .map(str::to_string),
            items,
        })
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, KubeError> {
        let path = kind.path(None, None);
        let mut query = vec![("watch", "true"), ("allowWatchBookmarks", "true")];
        if let Some(rv) = resource_version {
            query.push(("resourceVersion", rv));
        }

        let response = self
            .send(self.request(Method::GET, &path).query(&query))
            .await?;
        debug!(kind = %kind, resource_version = ?resource_version, "watch opened");

        let body = response.bytes_stream().boxed();
        let events = futures_util::stream::unfold(
            (body, BytesMut::new(), false),
            |(mut body, mut buffer, mut done)| async move {
                loop {
                    if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        if line.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        let event = WatchEvent::from_line(&line[..pos]);
                        return Some((event, (body, buffer, done)));
                    }
                    if done {
                        if buffer.iter().all(u8::is_ascii_whitespace) {
                            return None;
                        }
                        let rest = buffer.split();
                        return Some((WatchEvent::from_line(&rest), (body, buffer, done)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            done = true;
                            buffer.clear();
                            return Some((Err(KubeError::Http(e)), (body, buffer, done)));
                        }
                        None => done = true,
                    }
                }
            },
        );
        Ok(events.boxed())
    }

    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        since_seconds: Option<i64>,
    ) -> Result<String, KubeError> {
        let path = format!("{}/log", ResourceKind::Pod.path(Some(namespace), Some(pod)));
        let mut builder = self
            .request(Method::GET, &path)
            .query(&[("timestamps", "true")]);
        if let Some(since) = since_seconds {
            builder = builder.query(&[("sinceSeconds", since.to_string())]);
        }

        let response = self.send(builder.timeout(REQUEST_TIMEOUT)).await?;
        Ok(response.text().await?)
    }
}
