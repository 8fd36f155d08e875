//! # Domain Model
//!
//! Gateway resources as defined by administrators, the immutable snapshots
//! the release pipeline freezes them into, and the audit records of each
//! publish attempt.
//!
//! ## Module Organization
//! - `gateway`: gateways, stages, backends and plugin bindings
//! - `resource`: live resources, snapshot records and resource versions
//! - `release`: release bindings, release history and publish events

pub mod gateway;
pub mod release;
pub mod resource;

pub use gateway::{
    Backend, BackendConfig, BackendHost, Gateway, LoadBalance, PluginBinding, Stage, Status,
};
pub use release::{
    NewPublishEvent, NewReleaseHistory, PublishEvent, PublishEventName, PublishEventStatus,
    PublishId, PublishSource, Release, ReleaseHistory, ReleaseStatus,
};
pub use resource::{
    NewResourceVersion, ProxyRecord, Resource, ResourceAuthConfig, ResourceProxyConfig,
    ResourceRecord, ResourceVersion, CURRENT_SCHEMA_VERSION,
};
