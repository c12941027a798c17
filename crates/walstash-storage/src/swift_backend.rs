use std::io::{Read, SeekFrom};
use std::time::Duration;

use crate::resume::ResumingReader;
use crate::retry::{classify_http, retry_blob};
use crate::BodyReader;
use crate::{
    BlobStore, CancelFlag, ObjectBody, ObjectMeta, Result, RetryConfig, StorageError, StorePrefix,
};

const GET_RESTARTS: u32 = 3;

/// OpenStack Swift backend (`swift://container/dir` prefixes).
///
/// Authenticates once at construction (auth v1 TempAuth, v2 Keystone, or v3
/// Keystone) and addresses objects under the returned storage URL.
pub struct SwiftStore {
    storage_url: String,
    token: String,
    container: String,
    root: String,
    agent: ureq::Agent,
    retry: RetryConfig,
    cancel: CancelFlag,
}

impl SwiftStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefix: &StorePrefix,
        auth_url: &str,
        tenant: &str,
        user: &str,
        password: &str,
        auth_version: &str,
        endpoint_type: &str,
        retry: RetryConfig,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let (storage_url, token) = match auth_version {
            "1" => auth_v1(&agent, auth_url, tenant, user, password)?,
            "2" => auth_v2(&agent, auth_url, tenant, user, password, endpoint_type)?,
            "3" => auth_v3(&agent, auth_url, tenant, user, password, endpoint_type)?,
            other => {
                return Err(StorageError::Config(format!(
                    "unsupported SWIFT_AUTH_VERSION '{other}' (expected 1, 2, or 3)"
                )))
            }
        };

        Ok(Self {
            storage_url,
            token,
            container: prefix.container.clone(),
            root: prefix.path.clone(),
            agent,
            retry,
            cancel,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn object_url(&self, full_key: &str) -> String {
        format!("{}/{}/{}", self.storage_url, self.container, full_key)
    }
}

fn auth_v1(
    agent: &ureq::Agent,
    auth_url: &str,
    tenant: &str,
    user: &str,
    password: &str,
) -> Result<(String, String)> {
    let auth_user = if tenant.is_empty() {
        user.to_string()
    } else {
        format!("{tenant}:{user}")
    };
    let resp = agent
        .get(auth_url)
        .set("X-Auth-User", &auth_user)
        .set("X-Auth-Key", password)
        .call()
        .map_err(|e| StorageError::Fatal(format!("swift v1 auth failed: {e}")))?;

    let storage_url = resp
        .header("X-Storage-Url")
        .ok_or_else(|| StorageError::Fatal("swift v1 auth: missing X-Storage-Url".into()))?
        .to_string();
    let token = resp
        .header("X-Auth-Token")
        .ok_or_else(|| StorageError::Fatal("swift v1 auth: missing X-Auth-Token".into()))?
        .to_string();
    Ok((storage_url, token))
}

fn auth_v2(
    agent: &ureq::Agent,
    auth_url: &str,
    tenant: &str,
    user: &str,
    password: &str,
    endpoint_type: &str,
) -> Result<(String, String)> {
    let url = format!("{}/tokens", auth_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "auth": {
            "tenantName": tenant,
            "passwordCredentials": {"username": user, "password": password},
        }
    });
    let resp = agent
        .post(&url)
        .set("Content-Type", "application/json")
        .send_string(&body.to_string())
        .map_err(|e| StorageError::Fatal(format!("swift v2 auth failed: {e}")))?;

    let parsed: serde_json::Value = serde_json::from_reader(resp.into_reader())
        .map_err(|e| StorageError::Fatal(format!("swift v2 auth: bad response: {e}")))?;
    let access = &parsed["access"];
    let token = access["token"]["id"]
        .as_str()
        .ok_or_else(|| StorageError::Fatal("swift v2 auth: missing token id".into()))?
        .to_string();
    let storage_url = object_store_endpoint(&access["serviceCatalog"], endpoint_type)?;
    Ok((storage_url, token))
}

fn auth_v3(
    agent: &ureq::Agent,
    auth_url: &str,
    tenant: &str,
    user: &str,
    password: &str,
    endpoint_type: &str,
) -> Result<(String, String)> {
    let url = format!("{}/auth/tokens", auth_url.trim_end_matches('/'));
    let body = serde_json::json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {"user": {
                    "name": user,
                    "domain": {"id": "default"},
                    "password": password,
                }},
            },
            "scope": {"project": {"name": tenant, "domain": {"id": "default"}}},
        }
    });
    let resp = agent
        .post(&url)
        .set("Content-Type", "application/json")
        .send_string(&body.to_string())
        .map_err(|e| StorageError::Fatal(format!("swift v3 auth failed: {e}")))?;

    let token = resp
        .header("X-Subject-Token")
        .ok_or_else(|| StorageError::Fatal("swift v3 auth: missing X-Subject-Token".into()))?
        .to_string();
    let parsed: serde_json::Value = serde_json::from_reader(resp.into_reader())
        .map_err(|e| StorageError::Fatal(format!("swift v3 auth: bad response: {e}")))?;
    let storage_url = object_store_endpoint_v3(&parsed["token"]["catalog"], endpoint_type)?;
    Ok((storage_url, token))
}

/// Pick the object-store endpoint of the requested type from a Keystone v2
/// service catalog.
fn object_store_endpoint(catalog: &serde_json::Value, endpoint_type: &str) -> Result<String> {
    // v2 endpoint entries carry `publicURL` / `internalURL` style keys.
    let key = endpoint_type;
    for service in catalog.as_array().into_iter().flatten() {
        if service["type"] == "object-store" {
            if let Some(url) = service["endpoints"]
                .as_array()
                .and_then(|eps| eps.first())
                .and_then(|ep| ep[key].as_str())
            {
                return Ok(url.trim_end_matches('/').to_string());
            }
        }
    }
    Err(StorageError::Fatal(format!(
        "swift auth: no object-store endpoint of type '{endpoint_type}' in catalog"
    )))
}

/// Same, for the Keystone v3 catalog shape (interface-keyed endpoints).
fn object_store_endpoint_v3(catalog: &serde_json::Value, endpoint_type: &str) -> Result<String> {
    let interface = endpoint_type.trim_end_matches("URL");
    for service in catalog.as_array().into_iter().flatten() {
        if service["type"] == "object-store" {
            for ep in service["endpoints"].as_array().into_iter().flatten() {
                if ep["interface"] == interface {
                    if let Some(url) = ep["url"].as_str() {
                        return Ok(url.trim_end_matches('/').to_string());
                    }
                }
            }
        }
    }
    Err(StorageError::Fatal(format!(
        "swift auth: no object-store endpoint of interface '{interface}' in catalog"
    )))
}

impl BlobStore for SwiftStore {
    fn put(&self, key: &str, len: u64, body: &mut dyn ObjectBody) -> Result<()> {
        let url = self.object_url(&self.full_key(key));
        retry_blob(&self.retry, &self.cancel, "PUT", "Swift", || {
            body.seek(SeekFrom::Start(0))?;
            self.agent
                .put(&url)
                .set("X-Auth-Token", &self.token)
                .set("Content-Length", &len.to_string())
                .send(BodyReader(&mut *body))
                .map_err(|e| classify_http("PUT", key, e))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.object_url(&self.full_key(key));
        let resp = retry_blob(&self.retry, &self.cancel, "GET", "Swift", || {
            self.agent
                .get(&url)
                .set("X-Auth-Token", &self.token)
                .call()
                .map_err(|e| classify_http("GET", key, e))
        })?;

        let agent = self.agent.clone();
        let token = self.token.clone();
        let reader = ResumingReader::new(
            Box::new(resp.into_reader()),
            GET_RESTARTS,
            move |offset| {
                let resp = agent
                    .get(&url)
                    .set("X-Auth-Token", &token)
                    .set("Range", &format!("bytes={offset}-"))
                    .call()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                Ok(Box::new(resp.into_reader()) as Box<dyn Read + Send>)
            },
        );
        Ok(Box::new(reader))
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full_prefix = self.full_key(prefix);
        let root_prefix_len = if self.root.is_empty() {
            0
        } else {
            self.root.len() + 1
        };

        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let url = format!(
                "{}/{}?format=json&prefix={}{}",
                self.storage_url,
                self.container,
                full_prefix,
                marker
                    .as_deref()
                    .map(|m| format!("&marker={m}"))
                    .unwrap_or_default()
            );
            let page: Vec<serde_json::Value> =
                retry_blob(&self.retry, &self.cancel, "LIST", "Swift", || {
                    let resp = self
                        .agent
                        .get(&url)
                        .set("X-Auth-Token", &self.token)
                        .call()
                        .map_err(|e| classify_http("LIST", prefix, e))?;
                    serde_json::from_reader(resp.into_reader()).map_err(|e| {
                        StorageError::Fatal(format!("LIST {prefix}: bad listing JSON: {e}"))
                    })
                })?;

            if page.is_empty() {
                break;
            }
            for entry in &page {
                let Some(name) = entry["name"].as_str() else {
                    continue;
                };
                marker = Some(name.to_string());
                let key = if root_prefix_len > 0 && name.len() > root_prefix_len {
                    name[root_prefix_len..].to_string()
                } else {
                    name.to_string()
                };
                objects.push(ObjectMeta {
                    key,
                    size: entry["bytes"].as_u64().unwrap_or(0),
                    last_modified: entry["last_modified"].as_str().map(str::to_string),
                });
            }
        }

        Ok(objects)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let url = self.object_url(&self.full_key(key));
            retry_blob(&self.retry, &self.cancel, "DELETE", "Swift", || {
                match self.agent.delete(&url).set("X-Auth-Token", &self.token).call() {
                    Ok(_) => Ok(()),
                    Err(ureq::Error::Status(404, _)) => Ok(()),
                    Err(e) => Err(classify_http("DELETE", key, e)),
                }
            })?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let url = self.object_url(&self.full_key(key));
        retry_blob(&self.retry, &self.cancel, "HEAD", "Swift", || {
            match self.agent.head(&url).set("X-Auth-Token", &self.token).call() {
                Ok(_) => Ok(true),
                Err(ureq::Error::Status(404, _)) => Ok(false),
                Err(e) => Err(classify_http("HEAD", key, e)),
            }
        })
    }
}
