pub mod auth;
pub mod booking;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod money;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod pricing;
pub mod reaper;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod validation;
pub mod wal;
pub mod wire;
