//! HTTP interfaces

pub mod results_http;
