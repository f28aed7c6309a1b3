//! launchpad: take a project from source to a running deployment.
//!
//! The core is the [`engine::WorkflowEngine`], which runs a fixed, ordered
//! pipeline per request (build, push, create project, deploy, monitor,
//! notify) with per-step retry and durable step memoization. Around it:
//! - [`queue`]: request intake and the dispatcher that executes runs
//! - [`builder`], [`platform`], [`notifier`], [`source`]: external seams
//! - [`analyzer`] and [`generate`]: project inspection and text generation
//! - [`http`]: the axum API

pub mod analyzer;
pub mod builder;
pub mod config;
pub mod engine;
pub mod error;
pub mod generate;
pub mod http;
pub mod model;
pub mod notifier;
pub mod platform;
pub mod queue;
pub mod runid;
pub mod source;
pub mod store;
