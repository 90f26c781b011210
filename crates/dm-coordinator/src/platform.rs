//! Platform API client lifecycle
//!
//! A [`PlatformClient`] is an opaque, cheaply cloneable handle to an
//! authenticated session against one system's platform API. The coordinator
//! never mutates a client; a rebuild produces a new handle with a new id.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use dm_common::{Error, Result, HTTPS_PREFIX, HTTP_PREFIX, SYSTEM_ENDPOINT_SECRET_NAME};

const OS_AUTH_URL: &str = "OS_AUTH_URL";
const OS_USERNAME: &str = "OS_USERNAME";
const OS_PASSWORD: &str = "OS_PASSWORD";
const OS_PROJECT_NAME: &str = "OS_PROJECT_NAME";
const OS_REGION_NAME: &str = "OS_REGION_NAME";
const OS_PROJECT_DOMAIN_NAME: &str = "OS_PROJECT_DOMAIN_NAME";
const OS_USER_DOMAIN_NAME: &str = "OS_USER_DOMAIN_NAME";
const OS_INTERFACE: &str = "OS_INTERFACE";

const DEFAULT_REGION: &str = "RegionOne";
const DEFAULT_DOMAIN: &str = "Default";
const DEFAULT_INTERFACE: &str = "public";

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Endpoint and credential attributes for a system's platform API
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformEndpoint {
    /// Identity service URL
    pub auth_url: String,
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Project (tenant) name
    pub project_name: String,
    /// Region name
    pub region_name: String,
    /// Domain of the project
    pub project_domain_name: String,
    /// Domain of the user
    pub user_domain_name: String,
    /// Endpoint interface (public, internal, admin)
    pub interface: String,
}

impl PlatformEndpoint {
    /// Load endpoint attributes from a secret's decoded data
    ///
    /// `OS_AUTH_URL`, `OS_USERNAME`, `OS_PASSWORD` and `OS_PROJECT_NAME` are
    /// required. The auth URL must use an http or https scheme.
    pub fn from_secret_data(namespace: &str, data: &BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            data.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::platform_client(
                        namespace,
                        format!("secret {} is missing {}", SYSTEM_ENDPOINT_SECRET_NAME, key),
                    )
                })
        };
        let optional = |key: &str, default: &str| -> String {
            data.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        let auth_url = required(OS_AUTH_URL)?;
        if !auth_url.starts_with(HTTPS_PREFIX) && !auth_url.starts_with(HTTP_PREFIX) {
            return Err(Error::platform_client(
                namespace,
                format!("{} must start with {} or {}", OS_AUTH_URL, HTTPS_PREFIX, HTTP_PREFIX),
            ));
        }

        Ok(Self {
            auth_url,
            username: required(OS_USERNAME)?,
            password: required(OS_PASSWORD)?,
            project_name: required(OS_PROJECT_NAME)?,
            region_name: optional(OS_REGION_NAME, DEFAULT_REGION),
            project_domain_name: optional(OS_PROJECT_DOMAIN_NAME, DEFAULT_DOMAIN),
            user_domain_name: optional(OS_USER_DOMAIN_NAME, DEFAULT_DOMAIN),
            interface: optional(OS_INTERFACE, DEFAULT_INTERFACE),
        })
    }

    /// True if the endpoint is reached over TLS
    pub fn is_secure(&self) -> bool {
        self.auth_url.starts_with(HTTPS_PREFIX)
    }
}

impl fmt::Debug for PlatformEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformEndpoint")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("project_name", &self.project_name)
            .field("region_name", &self.region_name)
            .field("project_domain_name", &self.project_domain_name)
            .field("user_domain_name", &self.user_domain_name)
            .field("interface", &self.interface)
            .finish()
    }
}

#[derive(Debug)]
struct ClientInner {
    id: u64,
    namespace: String,
    endpoint: PlatformEndpoint,
}

/// Shared handle to a platform API session for one namespace
#[derive(Debug, Clone)]
pub struct PlatformClient {
    inner: Arc<ClientInner>,
}

impl PlatformClient {
    /// Create a new client handle with a process-unique id
    pub fn new(namespace: impl Into<String>, endpoint: PlatformEndpoint) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                namespace: namespace.into(),
                endpoint,
            }),
        }
    }

    /// Process-unique id of this client
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Namespace the client was built for
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Endpoint attributes the client was built from
    pub fn endpoint(&self) -> &PlatformEndpoint {
        &self.inner.endpoint
    }

    /// True if both handles refer to the same client instance
    pub fn ptr_eq(&self, other: &PlatformClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Trait for building platform clients
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClientFactory: Send + Sync {
    /// Build a client for the system in `namespace`
    async fn build(&self, namespace: &str) -> Result<PlatformClient>;
}

/// Builds clients from the `system-endpoint` secret in each namespace
pub struct SecretClientFactory {
    client: Client,
}

impl SecretClientFactory {
    /// Create a new factory wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Merge a secret's binary and string data; string data wins on conflict
fn secret_data(namespace: &str, secret: &Secret) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();

    if let Some(data) = &secret.data {
        for (key, value) in data {
            let decoded = String::from_utf8(value.0.clone()).map_err(|_| {
                Error::platform_client(
                    namespace,
                    format!("secret {} key {} is not valid UTF-8", SYSTEM_ENDPOINT_SECRET_NAME, key),
                )
            })?;
            merged.insert(key.clone(), decoded);
        }
    }
    if let Some(data) = &secret.string_data {
        merged.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    Ok(merged)
}

#[async_trait]
impl PlatformClientFactory for SecretClientFactory {
    async fn build(&self, namespace: &str) -> Result<PlatformClient> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(SYSTEM_ENDPOINT_SECRET_NAME)
            .await
            .map_err(|e| {
                Error::platform_client(
                    namespace,
                    format!("failed to read secret {}: {}", SYSTEM_ENDPOINT_SECRET_NAME, e),
                )
            })?
            .ok_or_else(|| {
                Error::platform_client(
                    namespace,
                    format!("secret {} not found", SYSTEM_ENDPOINT_SECRET_NAME),
                )
            })?;

        let data = secret_data(namespace, &secret)?;
        let endpoint = PlatformEndpoint::from_secret_data(namespace, &data)?;

        debug!(
            namespace = %namespace,
            auth_url = %endpoint.auth_url,
            region = %endpoint.region_name,
            "built platform client from endpoint secret"
        );

        Ok(PlatformClient::new(namespace, endpoint))
    }
}
