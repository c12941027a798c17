use std::io::{Read, SeekFrom};
use std::time::Duration;

use rusty_s3::actions::{ListObjectsV2, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::resume::ResumingReader;
use crate::retry::{classify_http, retry_blob};
use crate::BodyReader;
use crate::{
    BlobStore, CancelFlag, ObjectBody, ObjectMeta, Result, RetryConfig, S3Convention, S3Endpoint,
    StorageError, StorePrefix,
};

/// Duration for presigned URL validity.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// Mid-stream restarts allowed per GET before the error surfaces.
const GET_RESTARTS: u32 = 3;

/// S3 and S3-compatible blob store (also serves `gs://` prefixes through
/// the storage.googleapis.com XML interoperability endpoint).
pub struct S3Store {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    cancel: CancelFlag,
    root: String,
    /// Server-side encryption header value, where the backend honors it.
    sse: Option<&'static str>,
    label: &'static str,
}

impl S3Store {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefix: &StorePrefix,
        access_key_id: &str,
        secret_access_key: &str,
        security_token: Option<&str>,
        region: &str,
        endpoint: Option<S3Endpoint>,
        retry: RetryConfig,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let (endpoint_url, url_style) = match &endpoint {
            Some(custom) => {
                let style = match custom.convention {
                    S3Convention::Path => UrlStyle::Path,
                    S3Convention::VirtualHost | S3Convention::Subdomain => UrlStyle::VirtualHost,
                };
                (custom.url.clone(), style)
            }
            None => (
                format!("https://s3.{region}.amazonaws.com"),
                UrlStyle::VirtualHost,
            ),
        };

        let credentials = match security_token {
            Some(token) => Credentials::new_with_token(access_key_id, secret_access_key, token),
            None => Credentials::new(access_key_id, secret_access_key),
        };

        Self::build(
            prefix,
            &endpoint_url,
            url_style,
            region,
            credentials,
            retry,
            cancel,
            Some("AES256"),
            "S3",
        )
    }

    /// GCS through its S3-interoperable XML API with HMAC credentials.
    pub fn interoperable_gs(
        prefix: &StorePrefix,
        access_key_id: &str,
        secret_access_key: &str,
        retry: RetryConfig,
        cancel: CancelFlag,
    ) -> Result<Self> {
        Self::build(
            prefix,
            "https://storage.googleapis.com",
            UrlStyle::Path,
            "auto",
            Credentials::new(access_key_id, secret_access_key),
            retry,
            cancel,
            None,
            "GS",
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        prefix: &StorePrefix,
        endpoint: &str,
        url_style: UrlStyle,
        region: &str,
        credentials: Credentials,
        retry: RetryConfig,
        cancel: CancelFlag,
        sse: Option<&'static str>,
        label: &'static str,
    ) -> Result<Self> {
        let base_url = endpoint.parse().map_err(|e| {
            StorageError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}"))
        })?;

        let bucket = Bucket::new(
            base_url,
            url_style,
            prefix.container.clone(),
            region.to_string(),
        )
        .map_err(|e| StorageError::Config(format!("failed to create bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Ok(Self {
            bucket,
            credentials,
            agent,
            retry,
            cancel,
            root: prefix.path.clone(),
            sse,
            label,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }

    fn get_url(&self, full_key: &str) -> url::Url {
        self.bucket
            .get_object(Some(&self.credentials), full_key)
            .sign(PRESIGN_DURATION)
    }
}

impl BlobStore for S3Store {
    fn put(&self, key: &str, len: u64, body: &mut dyn ObjectBody) -> Result<()> {
        let full_key = self.full_key(key);
        let mut action = self.bucket.put_object(Some(&self.credentials), &full_key);
        if let Some(sse) = self.sse {
            action
                .headers_mut()
                .insert("x-amz-server-side-encryption", sse);
        }
        let url = action.sign(PRESIGN_DURATION);

        retry_blob(&self.retry, &self.cancel, "PUT", self.label, || {
            body.seek(SeekFrom::Start(0))?;
            let mut req = self
                .agent
                .put(url.as_str())
                .set("Content-Length", &len.to_string());
            if let Some(sse) = self.sse {
                req = req.set("x-amz-server-side-encryption", sse);
            }
            req.send(BodyReader(&mut *body))
                .map_err(|e| classify_http("PUT", key, e))?;
            Ok(())
        })
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let full_key = self.full_key(key);
        let url = self.get_url(&full_key);

        let resp = retry_blob(&self.retry, &self.cancel, "GET", self.label, || {
            self.agent
                .get(url.as_str())
                .call()
                .map_err(|e| classify_http("GET", key, e))
        })?;

        // Build a range-request closure for mid-stream resumption. The
        // presigned URL stays valid for the whole transfer window.
        let agent = self.agent.clone();
        let resume_url = url.clone();
        let reader = ResumingReader::new(
            Box::new(resp.into_reader()),
            GET_RESTARTS,
            move |offset| {
                let resp = agent
                    .get(resume_url.as_str())
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
            self.root.len() + 1 // +1 for the '/'
        };

        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action.query_mut().insert("prefix", &full_prefix);
            if let Some(ref token) = continuation_token {
                action.query_mut().insert("continuation-token", token);
            }
            let url = action.sign(PRESIGN_DURATION);

            let body = retry_blob(&self.retry, &self.cancel, "LIST", self.label, || {
                let resp = self
                    .agent
                    .get(url.as_str())
                    .call()
                    .map_err(|e| classify_http("LIST", prefix, e))?;
                let mut body = Vec::new();
                resp.into_reader().read_to_end(&mut body)?;
                Ok(body)
            })?;

            let body_str = std::str::from_utf8(&body).map_err(|e| {
                StorageError::Fatal(format!("LIST {prefix}: failed to parse response: {e}"))
            })?;
            let parsed = ListObjectsV2::parse_response(body_str).map_err(|e| {
                StorageError::Fatal(format!("LIST {prefix}: failed to parse response: {e}"))
            })?;

            for obj in &parsed.contents {
                if obj.key.ends_with('/') {
                    continue; // directory markers
                }
                let key = if root_prefix_len > 0 && obj.key.len() > root_prefix_len {
                    obj.key[root_prefix_len..].to_string()
                } else {
                    obj.key.clone()
                };
                objects.push(ObjectMeta {
                    key,
                    size: obj.size,
                    last_modified: Some(obj.last_modified.clone()),
                });
            }

            match parsed.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(objects)
    }

    fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let full_key = self.full_key(key);
            let url = self
                .bucket
                .delete_object(Some(&self.credentials), &full_key)
                .sign(PRESIGN_DURATION);

            retry_blob(&self.retry, &self.cancel, "DELETE", self.label, || {
                match self.agent.delete(url.as_str()).call() {
                    Ok(_) => Ok(()),
                    // Deleting an absent key is a no-op.
                    Err(ureq::Error::Status(404, _)) => Ok(()),
                    Err(e) => Err(classify_http("DELETE", key, e)),
                }
            })?;
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let full_key = self.full_key(key);
        let url = self
            .bucket
            .head_object(Some(&self.credentials), &full_key)
            .sign(PRESIGN_DURATION);

        retry_blob(&self.retry, &self.cancel, "HEAD", self.label, || {
            match self.agent.head(url.as_str()).call() {
                Ok(_) => Ok(true),
                Err(ureq::Error::Status(404, _)) => Ok(false),
                Err(e) => Err(classify_http("HEAD", key, e)),
            }
        })
    }
}
