pub mod activity;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod flight;
pub mod locator;
pub mod record;
pub mod tail;
pub mod util;
