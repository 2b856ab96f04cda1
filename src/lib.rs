//! hyphae library crate
//!
//! The self-healing loop as a library: the binary is a thin clap wrapper,
//! and every phase can be driven directly against fake collaborators.

pub mod artifact;
pub mod classify;
pub mod collector;
pub mod config;
pub mod cycle;
pub mod health;
pub mod inbox;
pub mod logging;
pub mod model;
pub mod patch;
pub mod reconcile;
pub mod retry;
pub mod runner;
pub mod store;
pub mod util;
pub mod vcs;

#[cfg(test)]
mod testing;
