//! Citadel - a confined static, CGI and SCGI web server
//!
//! Core library: request pipeline, site layout, handlers and process plumbing.

pub mod access_log;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod http;
pub mod proxy;
pub mod server;
pub mod site;
