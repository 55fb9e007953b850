//! Core domain types
//!
//! This module contains the structures shared by the runner and the
//! orchestrator: what a service is, which image it runs, how its ports are
//! published and where its output goes.

pub mod image;
pub mod log;
pub mod port;
pub mod service;
