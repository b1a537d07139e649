//! Gatekeeper: admission control and policy governance for autonomous agents.
//!
//! Sandbox agents run contained; governed agents run only while a signed
//! proof binds their exact spec to the live policy. Policies hot-reload
//! atomically, drift is detected on a schedule, and safe remediation is
//! applied within a bounded blast radius.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;

pub mod types;

pub mod proof;
pub mod store;

pub mod audit;
pub mod policy;

pub mod admission;
pub mod drift;
pub mod remediation;

pub mod governance;
