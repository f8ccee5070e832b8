//! Write path: poll scheduler, metrics sink and the local status surface.

pub mod http;
pub mod poller;
pub mod sink;
