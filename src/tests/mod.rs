//! Integration-style tests of the dual Newton solver.

pub mod scenarios;
pub mod support;
