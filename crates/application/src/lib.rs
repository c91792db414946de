#![forbid(unsafe_code)]

pub mod endpoint_policy_impl;
pub mod sync_controller;

pub use endpoint_policy_impl::{EndpointPolicyService, PolicyUpdate};
