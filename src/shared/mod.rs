pub mod models;
pub mod state;
