pub mod app;
pub mod cli;
pub mod config;
pub mod executor;
pub mod request;
pub mod revision;
pub mod scm;
pub mod session;
pub mod ui;
pub mod util;
