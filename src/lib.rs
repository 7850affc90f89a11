pub mod app;
pub mod control;
pub mod gitlab;
pub mod monitor;
pub mod notify;
