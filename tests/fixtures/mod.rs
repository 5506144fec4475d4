//! Test fixtures

pub mod sim_stack;

pub use sim_stack::{PRIMARY, SECONDARY, SimStack, init_tracing};
