pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod runner;
pub mod shutdown;
