//! Kubernetes ConfigMap object store.
//!
//! Each state object is one ConfigMap in the object's namespace:
//!
//!   payload:     `binaryData[<data_key>]` (base64 on the wire)
//!   annotations: `metadata.annotations`
//!   revision:    `metadata.resourceVersion`, echoed back on update
//!
//! An update starts from the ConfigMap as last read, so labels, `data`,
//! other `binaryData` keys and any other field written by someone else
//! survive a state write.

use axum::http::StatusCode;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::backend::{ObjectStore, StateObject, StoreFuture};
use crate::errors::{CollaboratorError, StoreError};
use crate::kube::{check_status, KubeClient};

/// Characters escaped in a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigMap {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    binary_data: BTreeMap<String, String>,
    /// `data`, `immutable` and anything else not modeled above.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
    /// Labels, owner references and the rest of the metadata.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// State objects stored as ConfigMaps through the Kubernetes API.
pub struct ConfigMapStore {
    client: KubeClient,
    data_key: String,
}

impl ConfigMapStore {
    pub fn new(client: KubeClient, data_key: impl Into<String>) -> Self {
        Self {
            client,
            data_key: data_key.into(),
        }
    }

    fn collection_path(namespace: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/configmaps",
            utf8_percent_encode(namespace, PATH_SEGMENT)
        )
    }

    fn object_path(namespace: &str, name: &str) -> String {
        format!(
            "{}/{}",
            Self::collection_path(namespace),
            utf8_percent_encode(name, PATH_SEGMENT)
        )
    }

    /// Build the ConfigMap to send. Starts from the retained copy when the
    /// object was read from the API, else from an empty ConfigMap.
    fn to_config_map(&self, object: StateObject) -> Result<ConfigMap, StoreError> {
        let mut config_map = match object.retained {
            Some(retained) => serde_json::from_value::<ConfigMap>(retained).map_err(|e| {
                CollaboratorError::transport(format!(
                    "configmap {}/{} cannot be rebuilt: {e}",
                    object.namespace, object.name
                ))
            })?,
            None => ConfigMap {
                api_version: String::new(),
                kind: String::new(),
                metadata: ObjectMeta {
                    name: String::new(),
                    namespace: String::new(),
                    resource_version: None,
                    annotations: BTreeMap::new(),
                    extra: Map::new(),
                },
                binary_data: BTreeMap::new(),
                extra: Map::new(),
            },
        };
        config_map.api_version = "v1".to_string();
        config_map.kind = "ConfigMap".to_string();
        config_map.metadata.name = object.name;
        config_map.metadata.namespace = object.namespace;
        config_map.metadata.resource_version = object.resource_version;
        config_map.metadata.annotations = object.annotations;
        match &object.payload {
            Some(payload) => {
                config_map
                    .binary_data
                    .insert(self.data_key.clone(), STANDARD.encode(payload));
            }
            None => {
                config_map.binary_data.remove(&self.data_key);
            }
        }
        Ok(config_map)
    }

    fn from_config_map(&self, config_map: ConfigMap) -> Result<StateObject, StoreError> {
        let retained = serde_json::to_value(&config_map).map_err(|e| {
            CollaboratorError::transport(format!(
                "configmap {}/{} cannot be retained: {e}",
                config_map.metadata.namespace, config_map.metadata.name
            ))
        })?;
        let payload = match config_map.binary_data.get(&self.data_key) {
            Some(encoded) => Some(Bytes::from(STANDARD.decode(encoded).map_err(|e| {
                CollaboratorError::transport(format!(
                    "configmap {}/{} has invalid binaryData: {e}",
                    config_map.metadata.namespace, config_map.metadata.name
                ))
            })?)),
            None => None,
        };
        Ok(StateObject {
            namespace: config_map.metadata.namespace,
            name: config_map.metadata.name,
            payload,
            annotations: config_map.metadata.annotations,
            resource_version: config_map.metadata.resource_version,
            retained: Some(retained),
        })
    }

    /// Send a request, mapping a 404 to `StoreError::NotFound`.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        namespace: &str,
        name: &str,
    ) -> Result<reqwest::Response, StoreError> {
        let response = request.send().await.map_err(CollaboratorError::from)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        Ok(check_status(response).await?)
    }

    async fn read_config_map(&self, response: reqwest::Response) -> Result<StateObject, StoreError> {
        let config_map: ConfigMap = response.json().await.map_err(CollaboratorError::from)?;
        self.from_config_map(config_map)
    }
}

impl ObjectStore for ConfigMapStore {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, StateObject> {
        Box::pin(async move {
            let request = self
                .client
                .request(Method::GET, &Self::object_path(namespace, name))
                .await?;
            let response = self.send(request, namespace, name).await?;
            self.read_config_map(response).await
        })
    }

    fn create(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            let (namespace, name) = (object.namespace.clone(), object.name.clone());
            let mut config_map = self.to_config_map(object)?;
            config_map.metadata.resource_version = None;
            let request = self
                .client
                .request(Method::POST, &Self::collection_path(&namespace))
                .await?
                .json(&config_map);
            // A 404 on create means the namespace is missing; report it as-is.
            let response = request.send().await.map_err(CollaboratorError::from)?;
            let response = check_status(response).await?;
            let created = self.read_config_map(response).await?;
            tracing::debug!("created configmap {}/{}", namespace, name);
            Ok(created)
        })
    }

    fn update(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            let (namespace, name) = (object.namespace.clone(), object.name.clone());
            let config_map = self.to_config_map(object)?;
            let request = self
                .client
                .request(Method::PUT, &Self::object_path(&namespace, &name))
                .await?
                .json(&config_map);
            let response = self.send(request, &namespace, &name).await?;
            self.read_config_map(response).await
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .client
                .request(Method::DELETE, &Self::object_path(namespace, name))
                .await?;
            self.send(request, namespace, name).await?;
            Ok(())
        })
    }
}
