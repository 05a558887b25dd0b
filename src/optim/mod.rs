//! # Optimization
//! Optimizers with decoupled parameter groups, learning rate schedules with warmup, global gradient
//! clipping and dynamic loss scaling for mixed precision training.

mod grad;
mod loss_scaler;
mod optimizer;
mod scheduler;

pub use grad::clip_grad_norm;
pub use loss_scaler::LossScaler;
pub use optimizer::{param_groups, Optimizer, ParamGroup, NO_DECAY};
pub use scheduler::{LrScheduler, ScheduleKind};
