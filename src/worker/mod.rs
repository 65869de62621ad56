//! Chain workers and the protocol used to drive them

pub mod boundary;
pub mod message;
pub mod queue;

pub use boundary::WorkerBoundary;
pub use message::{
    parse_timer_tag, timer_tag, Envelope, StartTimerData, TimerCommand, TimerVerb,
    TriggerTimerData, WorkerEvent, WorkerFailure, WorkerMessage,
};
pub use queue::{QueueConfig, WorkerQueue};
