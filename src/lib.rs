pub mod auth;
pub mod backup;
pub mod config;
pub mod db;
pub mod handlers;
pub mod mail;
pub mod model;
pub mod rate_limit;
