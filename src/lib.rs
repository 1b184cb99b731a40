#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod media;
pub mod naming;
pub mod orchestrator;
pub mod package;
pub mod resolver;
pub mod security;
pub mod url;
pub mod workspace;
