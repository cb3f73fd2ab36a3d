pub mod clock;
pub mod config;
pub mod control;
pub mod export;
pub mod monitor;
pub mod recipe;
pub mod synth;
pub mod wire;
pub mod worker;
