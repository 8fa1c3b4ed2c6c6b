pub mod body;
pub mod browser;
pub mod config;
pub mod emitter;
pub mod event;
pub mod feed;
pub mod interceptor;
pub mod network;
pub mod proxy;
pub mod recorder;
pub mod snapshot;
pub mod tracker;
