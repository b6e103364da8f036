pub mod clock;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod handler;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod time;
