use std::fmt;

use crate::error::ClusterError;

/// Lifecycle of one dispatched task on one replica.
///
/// ```text
/// Pending -> Applied -> Committed
///                    -> Compensating -> Done
///                                    -> Escalated
/// Pending -> Conflicted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Applied,
    Conflicted,
    Committed,
    Compensating,
    Done,
    Escalated,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Conflicted | TaskState::Committed | TaskState::Done | TaskState::Escalated
        )
    }

    pub fn can_transition_to(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Applied)
                | (TaskState::Pending, TaskState::Conflicted)
                | (TaskState::Applied, TaskState::Committed)
                | (TaskState::Applied, TaskState::Compensating)
                | (TaskState::Compensating, TaskState::Done)
                | (TaskState::Compensating, TaskState::Escalated)
        )
    }

    pub fn validate_transition(&self, next: &Self) -> Result<(), ClusterError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ClusterError::InvalidTransition { from: *self, to: *next })
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: TaskState) -> Result<(), ClusterError> {
        self.validate_transition(&next)?;
        *self = next;
        Ok(())
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Applied => "applied",
            TaskState::Conflicted => "conflicted",
            TaskState::Committed => "committed",
            TaskState::Compensating => "compensating",
            TaskState::Done => "done",
            TaskState::Escalated => "escalated",
        };
        write!(f, "{}", name)
    }
}
