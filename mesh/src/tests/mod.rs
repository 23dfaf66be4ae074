//! Internal tests module
//!
//! Multi-node tests that run real managers over the in-process bus, with
//! access to private crate internals.

mod cluster;
