pub mod badge;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod models;
pub mod notify;
pub mod session;
pub mod state;
pub mod store;
