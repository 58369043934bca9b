#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The task execution engine and frame logger that together generate and
//! record load for one worker process.

mod align;
mod logger;
mod task;

pub use align::{align, average, clip, summarize, AlignError, OrderedPercentile, Summary, PERCENTILES};
pub use logger::{EventInfo, Frame, Logger};
pub use task::{
    stop_channel, Ctx, EventPath, EventReport, LeafOp, Node, Runner, StopHandle, StopSignal,
    TaskTree, WorkerMessage,
};
