//! Shared utility functions

pub mod math;
