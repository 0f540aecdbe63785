//! Protoflow - protocol and step orchestration
//!
//! A protocol is an ordered list of steps declared in a spec. Protoflow plans
//! it into durable step runs, dispatches each step to an execution engine,
//! gates it through QA and applies loop and trigger policies to the outcome.
//! CI callbacks are reconciled onto the same guarded state machines.

pub mod budget;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod id;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod reconcile;
pub mod spec;
pub mod store;

pub use error::{ProtoflowError, Result};
