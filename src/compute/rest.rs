//! REST implementation of [`ComputeService`] for `compute.googleapis.com`

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ComputeService, Image, Instance, Operation};
use crate::{Error, Result};

/// Base URL of the Compute Engine v1 API
pub const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";

/// Compute Engine client authenticating with an OAuth bearer token
pub struct GceComputeClient {
    http: Client,
    base_url: String,
    access_token: String,
}

impl GceComputeClient {
    /// Create a client for the public Compute Engine endpoint
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(COMPUTE_API_BASE, access_token)
    }

    /// Create a client against a custom endpoint (emulators, proxies)
    pub fn with_base_url(base_url: impl Into<String>, access_token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| Error::compute(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%method, %url, "compute API request");
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::compute(format!("{}: {}", what, e)))?;
        decode_response(response, what).await
    }
}

/// Map an API response to a value, keeping 404 distinguishable
async fn decode_response<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(Error::not_found(format!("{}: Error 404", what)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::compute(format!(
            "{}: Error {}: {}",
            what,
            status.as_u16(),
            body
        )));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| Error::serialization(format!("{}: {}", what, e)))
}

#[async_trait]
impl ComputeService for GceComputeClient {
    async fn images_get(&self, project: &str, image: &str) -> Result<Image> {
        let path = format!("projects/{}/global/images/{}", project, image);
        self.send(self.request(Method::GET, &path), &format!("get image {}", image))
            .await
    }

    async fn images_get_from_family(&self, project: &str, family: &str) -> Result<Image> {
        let path = format!("projects/{}/global/images/family/{}", project, family);
        self.send(
            self.request(Method::GET, &path),
            &format!("get image family {}", family),
        )
        .await
    }

    async fn instances_get(&self, project: &str, zone: &str, instance: &str) -> Result<Instance> {
        let path = format!("projects/{}/zones/{}/instances/{}", project, zone, instance);
        self.send(
            self.request(Method::GET, &path),
            &format!("get instance {}", instance),
        )
        .await
    }

    async fn instances_insert(
        &self,
        project: &str,
        zone: &str,
        instance: &Instance,
    ) -> Result<Operation> {
        let path = format!("projects/{}/zones/{}/instances", project, zone);
        self.send(
            self.request(Method::POST, &path).json(instance),
            &format!("insert instance {}", instance.name),
        )
        .await
    }

    async fn instances_delete(
        &self,
        project: &str,
        zone: &str,
        instance: &str,
    ) -> Result<Operation> {
        let path = format!("projects/{}/zones/{}/instances/{}", project, zone, instance);
        self.send(
            self.request(Method::DELETE, &path),
            &format!("delete instance {}", instance),
        )
        .await
    }

    async fn zone_operations_get(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation> {
        let path = format!("projects/{}/zones/{}/operations/{}", project, zone, operation);
        self.send(
            self.request(Method::GET, &path),
            &format!("get operation {}", operation),
        )
        .await
    }
}
