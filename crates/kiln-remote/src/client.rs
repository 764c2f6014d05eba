//! RestClient — HTTP/JSON implementation of the collaborator traits.
//!
//! Authenticates lazily with `POST /auth` and caches the bearer token. A
//! `401` on a cached token triggers exactly one re-authentication.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kiln_core::config::ApiConfig;
use kiln_state::{MetadataStore, StateError, StateResult};

use crate::api::*;
use crate::error::{RemoteError, RemoteResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct AuthResponse {
    access_token: String,
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    key: Option<String>,
    token: Mutex<Option<String>>,
}

impl RestClient {
    pub fn new(config: &ApiConfig) -> RemoteResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("kiln/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            key: config.key.clone(),
            token: Mutex::new(None),
        })
    }

    /// Namespace the client authenticates as.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn bearer(&self) -> RemoteResult<Option<String>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            return Ok(Some(t.clone()));
        }

        let url = format!("{}/auth", self.base_url);
        debug!(%url, namespace = %self.namespace, "authenticating");
        let resp = self
            .http
            .post(&url)
            .json(&json!({"namespace": self.namespace, "key": key}))
            .send()
            .await?;
        let auth: AuthResponse = check(resp).await?.json().await?;
        *token = Some(auth.access_token.clone());
        Ok(Some(auth.access_token))
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> RemoteResult<Response> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 0..2 {
            let mut req = self.http.request(method.clone(), &url);
            if let Some(token) = self.bearer().await? {
                req = req.bearer_auth(token);
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            debug!(%method, %url, "API request");
            let resp = req.send().await?;

            if resp.status() == StatusCode::UNAUTHORIZED && attempt == 0 && self.key.is_some() {
                warn!(%url, "token rejected, re-authenticating");
                *self.token.lock().await = None;
                continue;
            }
            return check(resp).await;
        }
        Err(RemoteError::Unauthorized(url))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> RemoteResult<T> {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    async fn call_empty(&self, method: Method, path: &str, body: Option<&Value>) -> RemoteResult<()> {
        self.send(method, path, body).await?;
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy.
async fn check(resp: Response) -> RemoteResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => RemoteError::NotFound(url),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RemoteError::Unauthorized(format!("{url}: {body}"))
        }
        _ => RemoteError::Api {
            status: status.as_u16(),
            body,
        },
    })
}

fn to_value<T: Serialize>(body: &T) -> RemoteResult<Value> {
    serde_json::to_value(body).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl ComputeApi for RestClient {
    async fn create_instance(&self, spec: &InstanceSpec) -> RemoteResult<Instance> {
        let body = to_value(spec)?;
        self.call(Method::POST, "/instances", Some(&body)).await
    }

    async fn get_instance(&self, uuid: &str) -> RemoteResult<Instance> {
        self.call(Method::GET, &format!("/instances/{uuid}"), None)
            .await
    }

    async fn delete_instance(&self, uuid: &str) -> RemoteResult<()> {
        self.call_empty(Method::DELETE, &format!("/instances/{uuid}"), None)
            .await
    }

    async fn get_interfaces(&self, uuid: &str) -> RemoteResult<Vec<NetworkInterface>> {
        self.call(Method::GET, &format!("/instances/{uuid}/interfaces"), None)
            .await
    }

    async fn list_agent_operations(&self, uuid: &str) -> RemoteResult<Vec<AgentOperation>> {
        self.call(
            Method::GET,
            &format!("/instances/{uuid}/agentoperations?all=true"),
            None,
        )
        .await
    }

    async fn get_agent_operation(&self, uuid: &str) -> RemoteResult<AgentOperation> {
        self.call(Method::GET, &format!("/agentoperations/{uuid}"), None)
            .await
    }

    async fn execute(&self, instance: &str, commandline: &str) -> RemoteResult<AgentOperation> {
        let body = json!({"commandline": commandline});
        self.call(
            Method::POST,
            &format!("/instances/{instance}/agent/execute"),
            Some(&body),
        )
        .await
    }

    async fn fetch_file(&self, instance: &str, path: &str) -> RemoteResult<AgentOperation> {
        let body = json!({"path": path});
        self.call(
            Method::POST,
            &format!("/instances/{instance}/agent/get"),
            Some(&body),
        )
        .await
    }

    async fn blob_chunks(&self, blob_uuid: &str) -> RemoteResult<Vec<Bytes>> {
        let mut resp = self
            .send(Method::GET, &format!("/blobs/{blob_uuid}/data"), None)
            .await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = resp.chunk().await? {
            chunks.push(chunk);
        }
        debug!(blob = %blob_uuid, chunks = chunks.len(), "blob downloaded");
        Ok(chunks)
    }

    async fn namespace_exists(&self, namespace: &str) -> RemoteResult<bool> {
        match self
            .call_empty(Method::GET, &format!("/auth/namespaces/{namespace}"), None)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_namespace(&self, namespace: &str) -> RemoteResult<()> {
        let body = json!({"namespace": namespace});
        self.call_empty(Method::POST, "/auth/namespaces", Some(&body))
            .await
    }
}

#[async_trait]
impl NetworkApi for RestClient {
    async fn allocate_network(&self, spec: &NetworkSpec) -> RemoteResult<Network> {
        let body = to_value(spec)?;
        self.call(Method::POST, "/networks", Some(&body)).await
    }

    async fn get_network(&self, uuid: &str) -> RemoteResult<Network> {
        self.call(Method::GET, &format!("/networks/{uuid}"), None)
            .await
    }

    async fn delete_network(&self, uuid: &str) -> RemoteResult<()> {
        self.call_empty(Method::DELETE, &format!("/networks/{uuid}"), None)
            .await
    }

    async fn route_address(&self, network: &str) -> RemoteResult<Option<String>> {
        self.call(Method::POST, &format!("/networks/{network}/route"), None)
            .await
    }

    async fn unroute_address(&self, network: &str, address: &str) -> RemoteResult<()> {
        self.call_empty(
            Method::DELETE,
            &format!("/networks/{network}/route/{address}"),
            None,
        )
        .await
    }
}

fn backend(e: RemoteError) -> StateError {
    StateError::Backend(e.to_string())
}

/// Namespace metadata lives on the API as one document per namespace.
#[async_trait]
impl MetadataStore for RestClient {
    async fn get_item(&self, namespace: &str, key: &str) -> StateResult<Option<Value>> {
        let path = format!("/auth/namespaces/{namespace}/metadata");
        match self.call::<Option<Value>>(Method::GET, &path, None).await {
            Ok(Some(Value::Object(mut items))) => Ok(items.remove(key)),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }

    async fn set_item(&self, namespace: &str, key: &str, value: &Value) -> StateResult<()> {
        let body = json!({"value": value});
        self.call_empty(
            Method::PUT,
            &format!("/auth/namespaces/{namespace}/metadata/{key}"),
            Some(&body),
        )
        .await
        .map_err(backend)
    }

    async fn delete_item(&self, namespace: &str, key: &str) -> StateResult<()> {
        match self
            .call_empty(
                Method::DELETE,
                &format!("/auth/namespaces/{namespace}/metadata/{key}"),
                None,
            )
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map_err(backend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = RestClient::new(&ApiConfig {
            url: "https://sf.example.com:13000/".into(),
            namespace: "team1".into(),
            key: None,
        })
        .unwrap();
        assert_eq!(client.base_url, "https://sf.example.com:13000");
        assert_eq!(client.namespace(), "team1");
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let client = RestClient::new(&ApiConfig {
            url: "http://127.0.0.1:9".into(),
            namespace: "system".into(),
            key: None,
        })
        .unwrap();
        let err = client.get_instance("i-1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)), "got {err}");
    }
}
