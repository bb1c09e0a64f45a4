//! reqwest implementation of [`ComputeApi`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use caph_common::{ComputeError, Error, Result};

use super::types::*;
use super::{ComputeApi, ComputeApiFactory, ComputeResult};

/// Public endpoint of the cloud API
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Largest page the API serves
const PAGE_SIZE: u32 = 50;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one project token
pub struct HCloudClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize, Default)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

impl HCloudClient {
    /// Client for `token` against `endpoint`, sharing `http`
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> ComputeResult<Value> {
        let url = format!("{}{}", self.endpoint, path);
        trace!(%method, %url, "cloud API request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(map_error(status, &text, path));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ComputeError::Decode(e.to_string()))
    }

    async fn get_one<T: DeserializeOwned>(&self, path: &str, key: &str) -> ComputeResult<T> {
        let value = self.call(Method::GET, path, &[], None).await?;
        field(value, key)
    }

    async fn send_one<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        key: &str,
        body: Value,
    ) -> ComputeResult<T> {
        let value = self.call(method, path, &[], Some(body)).await?;
        field(value, key)
    }

    async fn action(&self, path: &str, body: Value) -> ComputeResult<()> {
        self.call(Method::POST, path, &[], Some(body)).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> ComputeResult<()> {
        self.call(Method::DELETE, path, &[], None).await?;
        Ok(())
    }

    /// Collect every page of a list endpoint
    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        query: Vec<(&str, String)>,
    ) -> ComputeResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let mut params = query.clone();
            params.push(("page", page.to_string()));
            params.push(("per_page", PAGE_SIZE.to_string()));

            let mut value = self.call(Method::GET, path, &params, None).await?;
            let meta: Meta = value
                .get_mut("meta")
                .map(Value::take)
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ComputeError::Decode(e.to_string()))?
                .unwrap_or_default();
            let batch: Vec<T> = field(value, key)?;
            items.extend(batch);

            match meta.pagination.and_then(|p| p.next_page) {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        debug!(path, count = items.len(), "listed cloud resources");
        Ok(items)
    }
}

fn field<T: DeserializeOwned>(mut value: Value, key: &str) -> ComputeResult<T> {
    let inner = value
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| ComputeError::Decode(format!("response has no {key:?} field")))?;
    serde_json::from_value(inner).map_err(|e| ComputeError::Decode(e.to_string()))
}

fn selector_query(selector: String) -> Vec<(&'static str, String)> {
    if selector.is_empty() {
        Vec::new()
    } else {
        vec![("label_selector", selector)]
    }
}

/// Map a failed response to a [`ComputeError`]
///
/// The status code decides for authentication, rate limiting and missing
/// resources; everything else keeps the API's error code.
pub fn map_error(status: StatusCode, body: &str, resource: &str) -> ComputeError {
    let detail = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::UNAUTHORIZED => ComputeError::Unauthorized { message },
        StatusCode::TOO_MANY_REQUESTS => ComputeError::RateLimited { message },
        StatusCode::NOT_FOUND => ComputeError::NotFound {
            resource: resource.to_string(),
        },
        _ => match detail {
            Some(d) if d.code == "unauthorized" => ComputeError::Unauthorized { message },
            Some(d) if d.code == "rate_limit_exceeded" => ComputeError::RateLimited { message },
            Some(d) if d.code == "not_found" => ComputeError::NotFound {
                resource: resource.to_string(),
            },
            Some(d) => ComputeError::Api {
                code: d.code,
                message: d.message,
            },
            None => ComputeError::Api {
                code: status.as_u16().to_string(),
                message,
            },
        },
    }
}

#[async_trait]
impl ComputeApi for HCloudClient {
    async fn list_servers(&self, selector: String) -> ComputeResult<Vec<Server>> {
        self.list_all("/servers", "servers", selector_query(selector))
            .await
    }

    async fn get_server(&self, id: i64) -> ComputeResult<Option<Server>> {
        match self.get_one(&format!("/servers/{id}"), "server").await {
            Ok(server) => Ok(Some(server)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_server(&self, opts: ServerCreateOpts) -> ComputeResult<Server> {
        let body = serde_json::to_value(&opts).map_err(|e| ComputeError::Decode(e.to_string()))?;
        self.send_one(Method::POST, "/servers", "server", body).await
    }

    async fn delete_server(&self, id: i64) -> ComputeResult<()> {
        self.delete(&format!("/servers/{id}")).await
    }

    async fn reboot_server(&self, id: i64) -> ComputeResult<()> {
        self.action(&format!("/servers/{id}/actions/reset"), json!({}))
            .await
    }

    async fn power_on_server(&self, id: i64) -> ComputeResult<()> {
        self.action(&format!("/servers/{id}/actions/poweron"), json!({}))
            .await
    }

    async fn shutdown_server(&self, id: i64) -> ComputeResult<()> {
        self.action(&format!("/servers/{id}/actions/shutdown"), json!({}))
            .await
    }

    async fn attach_server_to_network(&self, server: i64, network: i64) -> ComputeResult<()> {
        self.action(
            &format!("/servers/{server}/actions/attach_to_network"),
            json!({ "network": network }),
        )
        .await
    }

    async fn list_networks(&self, selector: String) -> ComputeResult<Vec<Network>> {
        self.list_all("/networks", "networks", selector_query(selector))
            .await
    }

    async fn create_network(&self, opts: NetworkCreateOpts) -> ComputeResult<Network> {
        let body = serde_json::to_value(&opts).map_err(|e| ComputeError::Decode(e.to_string()))?;
        self.send_one(Method::POST, "/networks", "network", body).await
    }

    async fn delete_network(&self, id: i64) -> ComputeResult<()> {
        self.delete(&format!("/networks/{id}")).await
    }

    async fn list_load_balancers(&self, selector: String) -> ComputeResult<Vec<LoadBalancer>> {
        self.list_all("/load_balancers", "load_balancers", selector_query(selector))
            .await
    }

    async fn create_load_balancer(
        &self,
        opts: LoadBalancerCreateOpts,
    ) -> ComputeResult<LoadBalancer> {
        let body = serde_json::to_value(&opts).map_err(|e| ComputeError::Decode(e.to_string()))?;
        self.send_one(Method::POST, "/load_balancers", "load_balancer", body)
            .await
    }

    async fn delete_load_balancer(&self, id: i64) -> ComputeResult<()> {
        self.delete(&format!("/load_balancers/{id}")).await
    }

    async fn rename_load_balancer(&self, id: i64, name: String) -> ComputeResult<LoadBalancer> {
        self.send_one(
            Method::PUT,
            &format!("/load_balancers/{id}"),
            "load_balancer",
            json!({ "name": name }),
        )
        .await
    }

    async fn change_load_balancer_algorithm(
        &self,
        id: i64,
        algorithm: String,
    ) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/change_algorithm"),
            json!({ "type": algorithm }),
        )
        .await
    }

    async fn change_load_balancer_type(&self, id: i64, type_: String) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/change_type"),
            json!({ "load_balancer_type": type_ }),
        )
        .await
    }

    async fn attach_load_balancer_to_network(&self, id: i64, network: i64) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/attach_to_network"),
            json!({ "network": network }),
        )
        .await
    }

    async fn add_target_server(
        &self,
        id: i64,
        server: i64,
        use_private_ip: bool,
    ) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/add_target"),
            json!({
                "type": "server",
                "server": { "id": server },
                "use_private_ip": use_private_ip,
            }),
        )
        .await
    }

    async fn remove_target_server(&self, id: i64, server: i64) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/remove_target"),
            json!({ "type": "server", "server": { "id": server } }),
        )
        .await
    }

    async fn add_service(&self, id: i64, service: LoadBalancerService) -> ComputeResult<()> {
        let body =
            serde_json::to_value(&service).map_err(|e| ComputeError::Decode(e.to_string()))?;
        self.action(&format!("/load_balancers/{id}/actions/add_service"), body)
            .await
    }

    async fn delete_service(&self, id: i64, listen_port: u16) -> ComputeResult<()> {
        self.action(
            &format!("/load_balancers/{id}/actions/delete_service"),
            json!({ "listen_port": listen_port }),
        )
        .await
    }

    async fn list_placement_groups(&self, selector: String) -> ComputeResult<Vec<PlacementGroup>> {
        self.list_all("/placement_groups", "placement_groups", selector_query(selector))
            .await
    }

    async fn create_placement_group(
        &self,
        opts: PlacementGroupCreateOpts,
    ) -> ComputeResult<PlacementGroup> {
        let body = serde_json::to_value(&opts).map_err(|e| ComputeError::Decode(e.to_string()))?;
        self.send_one(Method::POST, "/placement_groups", "placement_group", body)
            .await
    }

    async fn delete_placement_group(&self, id: i64) -> ComputeResult<()> {
        self.delete(&format!("/placement_groups/{id}")).await
    }

    async fn list_server_types(&self) -> ComputeResult<Vec<ServerType>> {
        self.list_all("/server_types", "server_types", Vec::new())
            .await
    }

    async fn list_images(&self, query: ImageQuery) -> ComputeResult<Vec<Image>> {
        let mut params = Vec::new();
        if let Some(name) = query.name {
            params.push(("name", name));
        }
        if let Some(selector) = query.label_selector {
            params.push(("label_selector", selector));
        }
        self.list_all("/images", "images", params).await
    }
}

/// Hands out [`HCloudClient`]s sharing one connection pool
pub struct HCloudClientFactory {
    http: reqwest::Client,
    endpoint: String,
}

impl HCloudClientFactory {
    /// Factory for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("caph/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal_with_context("HCloudClientFactory", e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

impl ComputeApiFactory for HCloudClientFactory {
    fn for_token(&self, token: &str) -> Arc<dyn ComputeApi> {
        Arc::new(HCloudClient::new(
            self.http.clone(),
            self.endpoint.clone(),
            token,
        ))
    }
}
