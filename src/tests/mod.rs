//! Cross-module test suites.

mod batch_tests;
mod middleware_tests;
mod server_tests;
