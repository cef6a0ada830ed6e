use std::fmt;

use log::debug;
use storage::{RecordId, RecordVersion};

use crate::task::RecordTask;

pub const TASK_TARGET: &str = "quorra::task";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received by a replica for execution.
    In,
    /// Sent by a coordinator.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// One task passing through a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTrace<'a> {
    pub node: &'a str,
    pub direction: Direction,
    pub operation: &'static str,
    pub rid: RecordId,
    pub version: RecordVersion,
}

impl<'a> TaskTrace<'a> {
    pub fn of(node: &'a str, direction: Direction, task: &RecordTask) -> Self {
        TaskTrace {
            node,
            direction,
            operation: task.name(),
            rid: task.rid,
            version: task.version,
        }
    }
}

impl fmt::Display for TaskTrace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} rid={} v={}",
            self.node, self.direction, self.operation, self.rid, self.version
        )
    }
}

pub fn trace_task(node: &str, direction: Direction, task: &RecordTask) {
    debug!(target: TASK_TARGET, "{}", TaskTrace::of(node, direction, task));
}
