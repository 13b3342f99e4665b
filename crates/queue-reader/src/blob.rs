//! Access to the storage service that holds the blobs messages refer to.
//!
//! The reader does not know how the storage service authenticates requests. It asks
//! a [`BlobResolver`] for the base URI and for the headers of each request, and lets
//! messages refresh the resolver's view of the storage topology through their
//! `data` field.

use crate::config::StorageConfig;
use crate::error::HydrationError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::fmt;
use tracing::debug;

#[cfg(test)]
#[path = "blob_tests.rs"]
mod tests;

/// Produces authenticated access to the blob storage service
pub trait BlobResolver: Send + Sync {
    /// Apply storage metadata carried by a message
    fn update_storage_info(&mut self, metadata: &Value);

    /// Headers for fetching the blob `key` from the storage partition `source`
    fn create_headers(&self, key: &str, source: &str) -> Result<HeaderMap, HydrationError>;

    /// Base URI of the storage API, without a trailing slash
    fn storage_uri(&self) -> &str;
}

const FILE_NAME_HEADER: &str = "x-kerberos-storage-filename";
const PROVIDER_HEADER: &str = "x-kerberos-storage-provider";
const ACCESS_KEY_HEADER: &str = "x-kerberos-storage-accesskey";
const SECRET_HEADER: &str = "x-kerberos-storage-secretaccesskey";

/// Resolver for the Kerberos Vault storage API
///
/// Every request carries the file name, the provider (the message's `source`) and
/// the account's access key and secret as `X-Kerberos-Storage-*` headers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VaultBlobResolver {
    uri: String,
    access_key: String,
    secret: String,
}

impl VaultBlobResolver {
    pub fn new(
        uri: impl Into<String>,
        access_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let mut uri = uri.into();
        trim_trailing_slash(&mut uri);
        Self {
            uri,
            access_key: access_key.into(),
            secret: secret.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.uri, &config.access_key, &config.secret)
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

fn trim_trailing_slash(uri: &mut String) {
    while uri.ends_with('/') {
        uri.pop();
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, HydrationError> {
    HeaderValue::from_str(value).map_err(|e| HydrationError::Resolver {
        message: format!("value for {} is not a valid header: {}", name, e),
    })
}

impl BlobResolver for VaultBlobResolver {
    /// Replace whichever of `uri`, `access_key` and `secret` the metadata carries
    ///
    /// Non-object metadata and non-string fields are ignored.
    fn update_storage_info(&mut self, metadata: &Value) {
        let Some(fields) = metadata.as_object() else {
            debug!("Ignoring storage metadata that is not an object");
            return;
        };

        if let Some(uri) = fields.get("uri").and_then(Value::as_str) {
            self.uri = uri.to_string();
            trim_trailing_slash(&mut self.uri);
        }
        if let Some(access_key) = fields.get("access_key").and_then(Value::as_str) {
            self.access_key = access_key.to_string();
        }
        if let Some(secret) = fields.get("secret").and_then(Value::as_str) {
            self.secret = secret.to_string();
        }

        debug!(uri = %self.uri, "Updated storage info");
    }

    fn create_headers(&self, key: &str, source: &str) -> Result<HeaderMap, HydrationError> {
        if self.uri.is_empty() {
            return Err(HydrationError::Resolver {
                message: "storage uri is not configured".to_string(),
            });
        }

        let mut headers = HeaderMap::new();
        for (name, value) in [
            (FILE_NAME_HEADER, key),
            (PROVIDER_HEADER, source),
            (ACCESS_KEY_HEADER, self.access_key.as_str()),
            (SECRET_HEADER, self.secret.as_str()),
        ] {
            let mut value = header_value(name, value)?;
            if name == SECRET_HEADER {
                value.set_sensitive(true);
            }
            headers.insert(HeaderName::from_static(name), value);
        }

        Ok(headers)
    }

    fn storage_uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Debug for VaultBlobResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultBlobResolver")
            .field("uri", &self.uri)
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}
