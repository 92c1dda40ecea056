//! Tests across the training components
//!
//! Unit tests live next to their modules; the tests here drive the full loop
//! on synthetic data and a real baseline detector.
