pub mod config;
pub mod geo;
pub mod models;
pub mod storage;
pub mod whitelist;
