mod app;
mod metrics;
mod remote;
mod simulator;

// for main.rs
pub use app::run;
