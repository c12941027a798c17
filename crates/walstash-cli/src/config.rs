//! Environment discovery: prefix context and per-backend credentials.
//!
//! Secrets are read from the environment only, never from argv, so they
//! cannot leak through process listings. The `WALE_*` environment names
//! are kept so widely deployed hook configurations keep working.

use std::sync::Arc;

use walstash_core::error::{ArchiveError, Result};
use walstash_core::pipeline::FilterSet;
use walstash_core::ArchiveContext;
use walstash_storage::{
    store_from_prefix, CancelFlag, RetryConfig, S3Endpoint, StoreCredentials, StorePrefix,
    StoreScheme,
};

const PREFIX_VARS: &[&str] = &[
    "WALE_S3_PREFIX",
    "WALE_WABS_PREFIX",
    "WALE_GS_PREFIX",
    "WALE_SWIFT_PREFIX",
    "WALE_FILE_PREFIX",
];

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn require_env(name: &str) -> Result<String> {
    env(name).ok_or_else(|| {
        ArchiveError::Config(format!(
            "{name} is required but not set (set the environment variable {name})"
        ))
    })
}

/// Find the one configured prefix context.
pub fn discover_prefix() -> Result<StorePrefix> {
    let set: Vec<(&str, String)> = PREFIX_VARS
        .iter()
        .filter_map(|name| env(name).map(|value| (*name, value)))
        .collect();

    match set.as_slice() {
        [] => Err(ArchiveError::Config(format!(
            "no storage prefix defined (set exactly one of {})",
            PREFIX_VARS.join(", ")
        ))),
        [(_, value)] => Ok(StorePrefix::parse(value).map_err(ArchiveError::Storage)?),
        many => Err(ArchiveError::Config(format!(
            "more than one storage prefix defined ({}); a single invocation must \
             operate under exactly one prefix context",
            many.iter().map(|(n, _)| *n).collect::<Vec<_>>().join(", ")
        ))),
    }
}

fn credentials_for(prefix: &StorePrefix) -> Result<StoreCredentials> {
    match prefix.scheme {
        StoreScheme::S3 => {
            let endpoint = match env("WALE_S3_ENDPOINT") {
                Some(raw) => Some(S3Endpoint::parse(&raw).map_err(ArchiveError::Storage)?),
                None => None,
            };
            Ok(StoreCredentials::S3 {
                access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
                secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
                security_token: env("AWS_SECURITY_TOKEN"),
                region: require_env("AWS_REGION")?,
                endpoint,
            })
        }
        StoreScheme::Wabs => {
            let access_key = env("WABS_ACCESS_KEY");
            let sas_token = env("WABS_SAS_TOKEN");
            if access_key.is_none() && sas_token.is_none() {
                return Err(ArchiveError::Config(
                    "WABS credentials are required but not provided (define one of \
                     WABS_ACCESS_KEY or WABS_SAS_TOKEN)"
                        .into(),
                ));
            }
            Ok(StoreCredentials::Wabs {
                account_name: require_env("WABS_ACCOUNT_NAME")?,
                access_key,
                sas_token,
            })
        }
        StoreScheme::Gs => Ok(StoreCredentials::Gs {
            access_key_id: require_env("GS_ACCESS_KEY_ID")?,
            secret_access_key: require_env("GS_SECRET_ACCESS_KEY")?,
        }),
        StoreScheme::Swift => Ok(StoreCredentials::Swift {
            auth_url: require_env("SWIFT_AUTHURL")?,
            tenant: require_env("SWIFT_TENANT")?,
            user: require_env("SWIFT_USER")?,
            password: require_env("SWIFT_PASSWORD")?,
            auth_version: env("SWIFT_AUTH_VERSION").unwrap_or_else(|| "2".to_string()),
            endpoint_type: env("SWIFT_ENDPOINT_TYPE").unwrap_or_else(|| "publicURL".to_string()),
        }),
        StoreScheme::File => Ok(StoreCredentials::None),
    }
}

/// Build the archive context for this invocation from the environment.
pub fn context_from_env(gpg_key_flag: Option<String>) -> Result<ArchiveContext> {
    let prefix = discover_prefix()?;
    let creds = credentials_for(&prefix)?;
    let cancel = CancelFlag::new();
    let store = store_from_prefix(&prefix, creds, RetryConfig::default(), cancel.clone())
        .map_err(ArchiveError::Storage)?;

    let gpg_key_id = gpg_key_flag.or_else(|| env("WALE_GPG_KEY_ID"));

    Ok(ArchiveContext {
        store: Arc::from(store),
        prefix,
        cancel,
        filters: FilterSet::lzop(gpg_key_id),
        tmp_dir: std::env::temp_dir(),
    })
}
