//! Job scheduler: handlers and the polling executor.

pub mod executor;
pub mod handler;

pub use executor::JobExecutor;
pub use handler::{
    AsyncContinuationHandler, JobHandler, JobHandlerRegistry, TimerTransitionHandler,
    ASYNC_CONTINUATION, TIMER_TRANSITION,
};
