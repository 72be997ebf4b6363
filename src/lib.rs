pub mod app;
pub mod blob;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod platform;
pub mod publish;
pub mod reporter;
pub mod retrieval;
pub mod song_link;
pub mod store;
