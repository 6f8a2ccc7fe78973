use crate::naming::{extract_group_and_kind, pluralize, NameError};
use crate::{EXTENSIONS_GROUP, EXTENSIONS_VERSION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A concrete API group and version, e.g. `company.com/v1`
///
/// The legacy core group has an empty name and renders as the bare version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResourceScope {
    #[default]
    Namespaced,
    Cluster,
}

/// One version declared by a third-party resource
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct APIVersion {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
}

impl APIVersion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_group: None,
        }
    }
}

/// Declaration of a schema-less resource type installed at runtime
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPartyResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub scope: ResourceScope,
    #[serde(default)]
    pub versions: Vec<APIVersion>,
}

impl ThirdPartyResource {
    pub const KIND: &'static str = "ThirdPartyResource";

    pub fn new(name: impl Into<String>, versions: &[&str]) -> Self {
        Self {
            api_version: Some(format!("{}/{}", EXTENSIONS_GROUP, EXTENSIONS_VERSION)),
            kind: Some(Self::KIND.to_string()),
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            description: None,
            scope: ResourceScope::Namespaced,
            versions: versions.iter().map(|v| APIVersion::new(*v)).collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// `(group, kind)` derived from the declaration name
    pub fn group_and_kind(&self) -> Result<(String, String), NameError> {
        extract_group_and_kind(self.name())
    }

    /// `<plural>.<group>`, unique per installed resource type
    pub fn identity(&self) -> Result<String, NameError> {
        let (group, kind) = self.group_and_kind()?;
        Ok(format!("{}.{}", pluralize(&kind), group))
    }
}

/// Storage envelope of one third-party resource instance
///
/// `data` is the caller's object with its metadata stripped, serialized as
/// JSON. The storage layer never looks inside it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThirdPartyResourceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub data: ByteString,
}

impl ThirdPartyResourceData {
    pub const KIND: &'static str = "ThirdPartyResourceData";

    pub fn new(metadata: ObjectMeta, data: Vec<u8>) -> Self {
        Self {
            api_version: Some(format!("{}/{}", EXTENSIONS_GROUP, EXTENSIONS_VERSION)),
            kind: Some(Self::KIND.to_string()),
            metadata,
            data: ByteString(data),
        }
    }
}
