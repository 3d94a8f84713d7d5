pub mod authz;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod model;
pub mod query;
pub mod rest;
pub mod service;
pub mod store;
