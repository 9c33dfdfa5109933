//! Store Custom Resource Definition
//!
//! A Store names an object-storage location for backups. The `backend` key
//! selects a storage adapter from the agent's registry; `variables` (merged
//! with the optional Secret's data) carry the adapter's settings.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Storage backends a Store may name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// Discards pushes; used for testing
    Noop,
    /// Local or mounted filesystem
    Filesystem,
    /// Amazon S3 or compatible
    S3,
    /// Google Cloud Storage
    Gcs,
}

impl StoreBackend {
    /// Registry key
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Filesystem => "filesystem",
            Self::S3 => "s3",
            Self::Gcs => "gcs",
        }
    }

    /// Variables the backend cannot work without
    pub fn required_variables(self) -> &'static [&'static str] {
        match self {
            Self::Noop => &[],
            Self::Filesystem => &[],
            Self::S3 => &["region", "accessKeyId", "secretAccessKey"],
            Self::Gcs => &["serviceAccountKey"],
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noop" => Ok(Self::Noop),
            "filesystem" => Ok(Self::Filesystem),
            "s3" => Ok(Self::S3),
            "gcs" => Ok(Self::Gcs),
            _ => Err(format!("unknown storage backend: {s}")),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification for a Store
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Store",
    plural = "stores",
    shortname = "sts",
    namespaced,
    status = "StoreStatus",
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".spec.backend"}"#,
    printcolumn = r#"{"name":"Bucket","type":"string","jsonPath":".spec.bucket"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Storage backend registry key (noop, filesystem, s3, gcs)
    pub backend: String,

    /// Bucket (or top-level directory) holding backups
    pub bucket: String,

    /// Prefix prepended to backup locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Backend settings
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,

    /// Secret whose data is merged over `variables`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl StoreSpec {
    /// Full object location for a backup, with the store prefix applied
    pub fn object_location(&self, location: &str) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/{}", prefix, location.trim_start_matches('/'))
            }
            _ => location.trim_start_matches('/').to_string(),
        }
    }
}

/// Status of a Store
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for a Store
    pub enum StoreReason: "Store" {
        /// Not yet validated
        Pending => Initial,
        /// A variable the backend needs is absent
        MissingVariable => Transient,
        /// The referenced Secret is missing or unreadable
        SecretAccessError => Transient,
        /// The backend name is not known
        UnknownBackend => Failed,
        /// Store can receive backups
        Ready => Succeeded,
    }
}

impl Reason for StoreReason {
    const KIND: &'static str = "Store";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::MissingVariable,
        Self::SecretAccessError,
        Self::UnknownBackend,
        Self::Ready,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Store, StoreReason, ResourceKind::Store);

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(prefix: Option<&str>) -> StoreSpec {
        StoreSpec {
            backend: "filesystem".to_string(),
            bucket: "backups".to_string(),
            prefix: prefix.map(str::to_string),
            variables: BTreeMap::new(),
            secret_ref: None,
        }
    }

    #[test]
    fn backend_parse_is_case_insensitive() {
        assert_eq!("S3".parse::<StoreBackend>(), Ok(StoreBackend::S3));
        assert_eq!("noop".parse::<StoreBackend>(), Ok(StoreBackend::Noop));
        assert!("azure".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn object_location_applies_prefix() {
        assert_eq!(spec(Some("prod/")).object_location("a.dump"), "prod/a.dump");
        assert_eq!(spec(Some("")).object_location("/a.dump"), "a.dump");
        assert_eq!(spec(None).object_location("x/a.dump"), "x/a.dump");
    }

    #[test]
    fn s3_requires_credentials() {
        assert!(StoreBackend::S3.required_variables().contains(&"accessKeyId"));
        assert!(StoreBackend::Noop.required_variables().is_empty());
    }
}
