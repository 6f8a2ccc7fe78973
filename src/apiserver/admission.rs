//! Admission chain consumed around every mutating request

use crate::{ApiError, Result};
use apiplane_common::GroupVersion;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// What a request is about to do, as seen by admission plugins
#[derive(Debug, Clone)]
pub struct AdmissionAttributes {
    pub operation: Operation,
    pub group_version: GroupVersion,
    pub resource: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub user: Option<String>,
}

#[async_trait]
pub trait Admission: Send + Sync {
    fn name(&self) -> &'static str;

    async fn admit(&self, attributes: &AdmissionAttributes) -> Result<()>;
}

pub struct AlwaysAdmit;

#[async_trait]
impl Admission for AlwaysAdmit {
    fn name(&self) -> &'static str {
        "AlwaysAdmit"
    }

    async fn admit(&self, _attributes: &AdmissionAttributes) -> Result<()> {
        Ok(())
    }
}

pub struct AlwaysDeny;

#[async_trait]
impl Admission for AlwaysDeny {
    fn name(&self) -> &'static str {
        "AlwaysDeny"
    }

    async fn admit(&self, attributes: &AdmissionAttributes) -> Result<()> {
        Err(ApiError::Forbidden(format!(
            "admission denied {:?} of {} in {}",
            attributes.operation, attributes.resource, attributes.group_version
        )))
    }
}

/// Resolve an admission plugin from its configuration name
pub fn admission_for_name(name: &str) -> Result<Arc<dyn Admission>> {
    match name {
        "AlwaysAdmit" => Ok(Arc::new(AlwaysAdmit)),
        "AlwaysDeny" => Ok(Arc::new(AlwaysDeny)),
        other => Err(ApiError::ConfigError(format!(
            "unknown admission plugin {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes() -> AdmissionAttributes {
        AdmissionAttributes {
            operation: Operation::Create,
            group_version: GroupVersion::new("company.com", "v1"),
            resource: "foos".into(),
            kind: "Foo".into(),
            namespace: Some("default".into()),
            name: Some("test".into()),
            user: None,
        }
    }

    #[tokio::test]
    async fn test_builtin_plugins() {
        let admit = admission_for_name("AlwaysAdmit").unwrap();
        assert!(admit.admit(&attributes()).await.is_ok());

        let deny = admission_for_name("AlwaysDeny").unwrap();
        let err = deny.admit(&attributes()).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        assert!(admission_for_name("NamespaceLifecycle").is_err());
    }
}
