pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod project;
pub mod protocol;
pub mod pty;
pub mod rate_limit;
pub mod session;
pub mod shutdown;
pub mod terminal;
pub mod tracker;
