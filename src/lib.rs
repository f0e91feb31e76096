pub mod api;
pub mod config;
pub mod db;
pub mod device;
pub mod error;
pub mod reconcile;
pub mod schedule;
pub mod store;
pub mod tuya;
pub mod watcher;
