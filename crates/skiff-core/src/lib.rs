//! Orchestration core for end-to-end tests against the provisioning control
//! plane.
//!
//! A test is a [`workflow::Workflow`] of named steps with dependencies. Step
//! actions come from the suites ([`suites::cluster`], [`suites::installation`],
//! [`suites::migration`]), which drive the remote API and block on waiters
//! until resources reach their target states. Two inbound HTTP servers run
//! alongside the workflow: the [`events::recorder::EventRecorder`] collects
//! state-change events for post-run verification, and the
//! [`webhook::WebhookSink`] feeds lifecycle webhooks to the waiters. The
//! [`harness`] module wires all of it together.

pub mod config;
pub mod events;
pub mod harness;
pub mod kube;
pub mod notify;
pub(crate) mod serve;
pub mod suites;
pub mod wait;
pub mod webhook;
pub mod workflow;
