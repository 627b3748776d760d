mod executor;
mod fuzzer;
mod queue;
mod statistics;

pub use crate::{
    executor::{
        CommandExecutor, ExecutionResult, Executor, ExecutorError, ExitReason, COVERAGE_FILE_ENV,
    },
    fuzzer::{Fuzzer, FuzzerOptions},
    queue::{ProcessingStage, Queue, QueueItem},
};
