//! Route container, group/version installation, discovery and the HTTP layer

pub mod admission;
pub mod container;
pub mod context;
pub mod discovery;
pub mod group_version;
pub mod handlers;

pub use container::RouteContainer;
pub use group_version::{APIGroupVersion, GroupVersionRegistrar, RestMapper, RestResource};
pub use handlers::ApiServerState;
