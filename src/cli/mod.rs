//! CLI module for protoflow - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for projects, protocol
//! runs, steps, CI callbacks and the worker pool.

pub mod commands;

pub use commands::Cli;
