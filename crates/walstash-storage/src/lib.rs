pub mod file_backend;
pub mod resume;
pub mod retry;
pub mod s3_backend;
pub mod swift_backend;
pub mod wabs_backend;

use std::io::{Read, Seek};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use url::Url;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Error model for blob operations.
///
/// `Transient` is retried by the centralized retry policy; on exhaustion it
/// is surfaced as-is so the calling task can fail its pool. `NotFound` is
/// kept distinct because wal-fetch uses it to detect end-of-archive.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Fatal(String),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Listing entry for `BlobStore::list`.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Key relative to the store prefix.
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

/// Request body that can be rewound for retries.
pub trait ObjectBody: Read + Seek + Send {}
impl<T: Read + Seek + Send> ObjectBody for T {}

/// Read adapter over a body trait object, for APIs with a sized `Read`
/// bound.
pub(crate) struct BodyReader<'a>(pub &'a mut dyn ObjectBody);

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

/// Abstract blob storage under a single prefix context.
///
/// Keys are `/`-separated paths relative to the prefix. All operations are
/// synchronous; retries for transient failures happen inside the backend
/// through the shared retry policy.
pub trait BlobStore: Send + Sync {
    /// Upload an object with a known content length. The body is rewound
    /// before each retry attempt.
    fn put(&self, key: &str, len: u64, body: &mut dyn ObjectBody) -> Result<()>;

    /// Download an object as a stream. The stream transparently resumes
    /// with a range request after a mid-stream disconnect where the
    /// backend supports it.
    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>>;

    /// List all objects under a key prefix. Pagination is transparent and
    /// no key is yielded twice within one invocation.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Delete objects. Deleting an absent key is a no-op.
    fn delete(&self, keys: &[String]) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;
}

/// Cooperative cancellation flag shared between a worker pool and the
/// retry loops of in-flight blob operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Retry policy knobs for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 250,
            retry_max_delay_ms: 10_000,
        }
    }
}

/// The blob store scheme named by the prefix URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScheme {
    S3,
    Wabs,
    Gs,
    Swift,
    File,
}

impl StoreScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreScheme::S3 => "s3",
            StoreScheme::Wabs => "wabs",
            StoreScheme::Gs => "gs",
            StoreScheme::Swift => "swift",
            StoreScheme::File => "file",
        }
    }
}

/// Parsed prefix context, e.g. `s3://bucket/dir`.
///
/// Two distinct writing clusters must never share a prefix; this type only
/// guarantees that a single invocation operates under exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePrefix {
    pub scheme: StoreScheme,
    /// Bucket (S3/GS), container (WABS/Swift), or empty for `file`.
    pub container: String,
    /// Path under the container, without leading or trailing slash.
    pub path: String,
}

impl StorePrefix {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StorageError::Config("prefix URL must not be empty".into()));
        }

        let url = Url::parse(trimmed)
            .map_err(|e| StorageError::Config(format!("invalid prefix URL '{trimmed}': {e}")))?;

        let scheme = match url.scheme() {
            "s3" => StoreScheme::S3,
            "wabs" => StoreScheme::Wabs,
            "gs" => StoreScheme::Gs,
            "swift" => StoreScheme::Swift,
            "file" => StoreScheme::File,
            other => {
                return Err(StorageError::Config(format!(
                    "unsupported prefix scheme '{other}' (expected s3, wabs, gs, swift, or file)"
                )))
            }
        };

        if scheme == StoreScheme::File {
            let path = url.path().to_string();
            if path.is_empty() || path == "/" {
                return Err(StorageError::Config(
                    "file prefix must name a directory".into(),
                ));
            }
            return Ok(Self {
                scheme,
                container: String::new(),
                path: path.trim_end_matches('/').to_string(),
            });
        }

        let container = url
            .host_str()
            .ok_or_else(|| {
                StorageError::Config(format!("prefix '{trimmed}' is missing a bucket/container"))
            })?
            .to_string();
        let path = url.path().trim_matches('/').to_string();

        Ok(Self {
            scheme,
            container,
            path,
        })
    }

    /// Prepend the prefix path to a relative key.
    pub fn full_key(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.path, key)
        }
    }
}

impl std::fmt::Display for StorePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.scheme == StoreScheme::File {
            write!(f, "file://{}", self.path)
        } else {
            write!(f, "{}://{}/{}", self.scheme.as_str(), self.container, self.path)
        }
    }
}

/// Addressing convention for a custom S3 endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Convention {
    Path,
    VirtualHost,
    Subdomain,
}

/// Custom S3 endpoint, `scheme+convention://host[:port]` where scheme is
/// `http` or `https` and convention is `path`, `virtualhost`, or `subdomain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Endpoint {
    pub url: String,
    pub convention: S3Convention,
}

impl S3Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme_part, rest) = raw.split_once("://").ok_or_else(|| {
            StorageError::Config(format!(
                "invalid S3 endpoint '{raw}': expected scheme+convention://host[:port]"
            ))
        })?;
        let (scheme, convention) = scheme_part.split_once('+').ok_or_else(|| {
            StorageError::Config(format!(
                "invalid S3 endpoint '{raw}': expected scheme+convention://host[:port]"
            ))
        })?;
        if !matches!(scheme, "http" | "https") {
            return Err(StorageError::Config(format!(
                "invalid S3 endpoint scheme '{scheme}': expected http or https"
            )));
        }
        let convention = match convention {
            "path" => S3Convention::Path,
            "virtualhost" => S3Convention::VirtualHost,
            "subdomain" => S3Convention::Subdomain,
            other => {
                return Err(StorageError::Config(format!(
                    "invalid S3 endpoint convention '{other}': expected path, virtualhost, or subdomain"
                )))
            }
        };
        if rest.is_empty() || rest.contains('/') {
            return Err(StorageError::Config(format!(
                "invalid S3 endpoint host '{rest}'"
            )));
        }
        Ok(Self {
            url: format!("{scheme}://{rest}"),
            convention,
        })
    }
}

/// Backend credentials, discovered by the caller (never from argv).
#[derive(Debug, Clone)]
pub enum StoreCredentials {
    S3 {
        access_key_id: String,
        secret_access_key: String,
        security_token: Option<String>,
        region: String,
        endpoint: Option<S3Endpoint>,
    },
    Wabs {
        account_name: String,
        access_key: Option<String>,
        sas_token: Option<String>,
    },
    Gs {
        access_key_id: String,
        secret_access_key: String,
    },
    Swift {
        auth_url: String,
        tenant: String,
        user: String,
        password: String,
        auth_version: String,
        endpoint_type: String,
    },
    None,
}

/// Construct the backend selected by the prefix scheme.
pub fn store_from_prefix(
    prefix: &StorePrefix,
    creds: StoreCredentials,
    retry: RetryConfig,
    cancel: CancelFlag,
) -> Result<Box<dyn BlobStore>> {
    match (prefix.scheme, creds) {
        (StoreScheme::File, _) => Ok(Box::new(file_backend::FileStore::new(&prefix.path)?)),
        (
            StoreScheme::S3,
            StoreCredentials::S3 {
                access_key_id,
                secret_access_key,
                security_token,
                region,
                endpoint,
            },
        ) => Ok(Box::new(s3_backend::S3Store::new(
            prefix,
            &access_key_id,
            &secret_access_key,
            security_token.as_deref(),
            &region,
            endpoint,
            retry,
            cancel,
        )?)),
        (
            StoreScheme::Gs,
            StoreCredentials::Gs {
                access_key_id,
                secret_access_key,
            },
        ) => Ok(Box::new(s3_backend::S3Store::interoperable_gs(
            prefix,
            &access_key_id,
            &secret_access_key,
            retry,
            cancel,
        )?)),
        (
            StoreScheme::Wabs,
            StoreCredentials::Wabs {
                account_name,
                access_key,
                sas_token,
            },
        ) => Ok(Box::new(wabs_backend::WabsStore::new(
            prefix,
            &account_name,
            access_key.as_deref(),
            sas_token.as_deref(),
            retry,
            cancel,
        )?)),
        (
            StoreScheme::Swift,
            StoreCredentials::Swift {
                auth_url,
                tenant,
                user,
                password,
                auth_version,
                endpoint_type,
            },
        ) => Ok(Box::new(swift_backend::SwiftStore::new(
            prefix,
            &auth_url,
            &tenant,
            &user,
            &password,
            &auth_version,
            &endpoint_type,
            retry,
            cancel,
        )?)),
        (scheme, _) => Err(StorageError::Config(format!(
            "credentials do not match the '{}' prefix scheme",
            scheme.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_s3_prefix() {
        let p = StorePrefix::parse("s3://mybucket/prod/pg").unwrap();
        assert_eq!(p.scheme, StoreScheme::S3);
        assert_eq!(p.container, "mybucket");
        assert_eq!(p.path, "prod/pg");
        assert_eq!(p.full_key("wal_005/x.lzo"), "prod/pg/wal_005/x.lzo");
    }

    #[test]
    fn parse_prefix_trailing_slash() {
        let p = StorePrefix::parse("s3://mybucket/prod/pg/").unwrap();
        assert_eq!(p.path, "prod/pg");
    }

    #[test]
    fn parse_prefix_bucket_root() {
        let p = StorePrefix::parse("wabs://container").unwrap();
        assert_eq!(p.scheme, StoreScheme::Wabs);
        assert_eq!(p.path, "");
        assert_eq!(p.full_key("wal_005/x.lzo"), "wal_005/x.lzo");
    }

    #[test]
    fn parse_file_prefix() {
        let p = StorePrefix::parse("file:///var/backups/pg").unwrap();
        assert_eq!(p.scheme, StoreScheme::File);
        assert_eq!(p.path, "/var/backups/pg");
    }

    #[test]
    fn parse_prefix_rejects_unknown_scheme() {
        let err = StorePrefix::parse("ftp://host/path").unwrap_err();
        assert!(err.to_string().contains("unsupported prefix scheme"));
    }

    #[test]
    fn parse_s3_endpoint_forms() {
        let e = S3Endpoint::parse("https+path://minio.local:9000").unwrap();
        assert_eq!(e.url, "https://minio.local:9000");
        assert_eq!(e.convention, S3Convention::Path);

        let e = S3Endpoint::parse("http+virtualhost://s3.example.com").unwrap();
        assert_eq!(e.url, "http://s3.example.com");
        assert_eq!(e.convention, S3Convention::VirtualHost);

        let e = S3Endpoint::parse("https+subdomain://s3.example.com").unwrap();
        assert_eq!(e.convention, S3Convention::Subdomain);
    }

    #[test]
    fn parse_s3_endpoint_rejects_bad_forms() {
        assert!(S3Endpoint::parse("https://host").is_err());
        assert!(S3Endpoint::parse("ftp+path://host").is_err());
        assert!(S3Endpoint::parse("https+bogus://host").is_err());
        assert!(S3Endpoint::parse("https+path://host/with/path").is_err());
    }

    #[test]
    fn cancel_flag_round_trip() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
