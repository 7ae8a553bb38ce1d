//! # Serverless Backend API
//!
//! Client for leaves that are not Kubernetes clusters but an external
//! compute API. Pods are submitted as *orders*; the backend materialises
//! each order as an *instance* and reports its phase when polled.
//!
//! There is no update verb. Instances are correlated with root pods purely
//! through the labels the order was submitted with.
//!
//! Endpoints (relative to the configured base URL):
//! - `POST   /v1/orders`                       submit an order
//! - `DELETE /v1/orders/{order_id}`            cancel an order
//! - `GET    /v1/instances?labelSelector=...`  list instances, optionally filtered

use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// A pod submitted to a serverless backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: String,
    pub labels: BTreeMap<String, String>,
    pub pod: Pod,
}

/// Lifecycle phase reported for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// A running (or finished) order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub order_id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub phase: InstancePhase,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Pod as submitted with the order
    pub pod: Pod,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    items: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Operations a serverless backend provides
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerlessApi: Send + Sync {
    /// Submit an order
    async fn create_order(&self, request: &OrderRequest) -> Result<Instance>;

    /// Instances carrying every label in `labels`
    async fn find_instances(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Instance>>;

    /// Every instance the backend knows about
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Cancel an order; an unknown order is not an error
    async fn delete_order(&self, order_id: &str) -> Result<()>;
}

/// [`ServerlessApi`] over HTTP/JSON
pub struct HttpServerlessApi {
    http_client: Client,
    base_url: String,
    token: Option<String>,
}

impl std::fmt::Debug for HttpServerlessApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerlessApi")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpServerlessApi {
    /// Create a client for the backend at `base_url`
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http_client = Client::builder().build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) if token.starts_with("Bearer ") => request.header("Authorization", token),
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn error_from(response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        Error::ServerlessApi { status, message }
    }

    async fn get_instances(&self, selector: Option<String>) -> Result<Vec<Instance>> {
        let mut request = self.authorize(self.http_client.get(self.url("instances")));
        if let Some(selector) = selector {
            request = request.query(&[("labelSelector", selector)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json::<InstanceList>().await?.items)
    }
}

/// Render labels as a `k=v,k2=v2` selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ServerlessApi for HttpServerlessApi {
    async fn create_order(&self, request: &OrderRequest) -> Result<Instance> {
        debug!(order_id = %request.order_id, "submitting serverless order");
        let response = self
            .authorize(self.http_client.post(self.url("orders")))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn find_instances(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Instance>> {
        self.get_instances(Some(label_selector(labels))).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.get_instances(None).await
    }

    async fn delete_order(&self, order_id: &str) -> Result<()> {
        let response = self
            .authorize(
                self.http_client
                    .delete(self.url(&format!("orders/{order_id}"))),
            )
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(order_id, "serverless order already gone");
                Ok(())
            }
            _ => Err(Self::error_from(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_selector_is_sorted() {
        let labels = BTreeMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "a=1,b=2");
    }

    #[test]
    fn test_instance_decodes_unknown_phase() {
        let instance: Instance = serde_json::from_str(
            r#"{"orderId":"o-1","phase":"Hibernating","labels":{"kosmos-io/pod-name":"web-1"},"pod":{"apiVersion":"v1","kind":"Pod","metadata":{"name":"web-1"}}}"#,
        )
        .unwrap();
        assert_eq!(instance.phase, InstancePhase::Unknown);
        assert_eq!(instance.labels["kosmos-io/pod-name"], "web-1");
        assert_eq!(instance.pod.metadata.name.as_deref(), Some("web-1"));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let api = HttpServerlessApi::new("https://compute.example.com/", None).unwrap();
        assert_eq!(api.url("orders"), "https://compute.example.com/v1/orders");
    }
}
