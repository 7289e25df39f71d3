pub mod api_router;
pub mod config;
pub mod dispatch;
pub mod generation;
pub mod ledger;
pub mod registry;
pub mod shared;
pub mod sweeper;
pub mod webhook;
pub mod workflow;
