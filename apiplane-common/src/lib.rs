//! Shared API types between the apiplane server and its clients
//!
//! This crate defines:
//! - The wire form of third-party resource declarations
//! - The storage envelope for third-party resource instances
//! - Group/version identifiers and the naming rules that derive kinds,
//!   plurals and storage paths from a declaration name

pub mod naming;
pub mod types;

pub use naming::{extract_group_and_kind, pluralize, NameError};
pub use types::{
    APIVersion, GroupVersion, ResourceScope, ThirdPartyResource, ThirdPartyResourceData,
};

/// Group that owns third-party resource declarations and their data
pub const EXTENSIONS_GROUP: &str = "extensions";

/// Version of the extensions group served by the API server
pub const EXTENSIONS_VERSION: &str = "v1beta1";

/// Root of every third-party instance key in the extensions storage destination
pub const THIRD_PARTY_DATA_ROOT: &str = "/ThirdPartyResourceData";

/// Storage key for a third-party resource type, relative to its destination prefix
///
/// `third_party_key_prefix("company.com", "foos")` is
/// `/ThirdPartyResourceData/company.com/foos`.
pub fn third_party_key_prefix(group: &str, plural: &str) -> String {
    format!("{}/{}/{}", THIRD_PARTY_DATA_ROOT, group, plural)
}
