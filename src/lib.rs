pub mod binding;
pub mod catalog;
pub mod config;
pub mod dispenser;
pub mod domain;
pub mod http;
pub mod instance;
pub mod store;
pub mod version;
