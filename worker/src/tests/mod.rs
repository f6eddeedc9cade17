//! Test modules for the worker crate

mod handler_tests;
mod host_tests;
mod support;
