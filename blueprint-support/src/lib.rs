//! # Blueprint Support
//!
//! Diagnostics helpers shared by the Blueprint crates: component chains,
//! name lists, short type names and "did you mean" suggestions.

pub mod rendering;
