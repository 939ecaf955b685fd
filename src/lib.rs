pub mod config;
pub mod cooldown;
pub mod dispatch;
pub mod ingest;
pub mod keys;
pub mod notify;
pub mod pyrus;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod store;
pub mod windows;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
