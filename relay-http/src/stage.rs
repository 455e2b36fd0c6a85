//! Lifecycle stages and handler priorities.

use std::fmt;

/// A point in a call's lifecycle where handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Request is built, nothing has been sent.
    Sending,
    /// Transport returned a response.
    Sent,
    /// Response passed validation and was decoded.
    Result,
    /// Response failed validation; an error payload was decoded.
    Error,
    /// A fault was raised somewhere in the call.
    Exception,
}

impl Stage {
    /// All stages in lifecycle order.
    pub const ALL: [Stage; 5] = [
        Stage::Sending,
        Stage::Sent,
        Stage::Result,
        Stage::Error,
        Stage::Exception,
    ];

    /// Stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Sending => "sending",
            Stage::Sent => "sent",
            Stage::Result => "result",
            Stage::Error => "error",
            Stage::Exception => "exception",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler priority within a stage.
///
/// Groups run in declaration order. Handlers inside a group run in
/// registration order, except [`Priority::Parallel`] whose handlers run
/// concurrently after every other group of the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Runs before everything else.
    First,
    /// Runs before default handlers.
    High,
    /// Default priority.
    #[default]
    Default,
    /// Runs after default handlers.
    Low,
    /// Runs after every sequential handler.
    Last,
    /// Runs concurrently, after every sequential group.
    Parallel,
}

impl Priority {
    /// All priorities in dispatch order.
    pub const ALL: [Priority; 6] = [
        Priority::First,
        Priority::High,
        Priority::Default,
        Priority::Low,
        Priority::Last,
        Priority::Parallel,
    ];

    /// Whether handlers of this priority run concurrently.
    pub fn is_parallel(&self) -> bool {
        matches!(self, Priority::Parallel)
    }
}
