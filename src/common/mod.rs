pub mod config;
pub mod error;
pub mod meter;

pub use config::Config;
pub use meter::AverageMeter;
