use serde::{Deserialize, Serialize};

/// Task lifecycle state (spec.md §4.5). Terminal states are sticky: once
/// reached, no further transition is ever written for that task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    WaitingForInterval,
    WaitingForPrerequisite,
    WaitingForLock,
    Failed,
    Success,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Success | TaskState::Canceled)
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            TaskState::WaitingForInterval
                | TaskState::WaitingForPrerequisite
                | TaskState::WaitingForLock
        )
    }

    /// Single-letter wire encoding (spec.md §4.3, §6): `Q/R/T/N/L/F/S/C`.
    pub fn to_code(self) -> char {
        match self {
            TaskState::Queued => 'Q',
            TaskState::Running => 'R',
            TaskState::WaitingForInterval => 'T',
            TaskState::WaitingForPrerequisite => 'N',
            TaskState::WaitingForLock => 'L',
            TaskState::Failed => 'F',
            TaskState::Success => 'S',
            TaskState::Canceled => 'C',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'Q' => TaskState::Queued,
            'R' => TaskState::Running,
            'T' => TaskState::WaitingForInterval,
            'N' => TaskState::WaitingForPrerequisite,
            'L' => TaskState::WaitingForLock,
            'F' => TaskState::Failed,
            'S' => TaskState::Success,
            'C' => TaskState::Canceled,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::WaitingForInterval => "WAITING_FOR_INTERVAL",
            TaskState::WaitingForPrerequisite => "WAITING_FOR_PREREQUISITE",
            TaskState::WaitingForLock => "WAITING_FOR_LOCK",
            TaskState::Failed => "FAILED",
            TaskState::Success => "SUCCESS",
            TaskState::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips() {
        for state in [
            TaskState::Queued,
            TaskState::Running,
            TaskState::WaitingForInterval,
            TaskState::WaitingForPrerequisite,
            TaskState::WaitingForLock,
            TaskState::Failed,
            TaskState::Success,
            TaskState::Canceled,
        ] {
            assert_eq!(TaskState::from_code(state.to_code()), Some(state));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::WaitingForLock.is_terminal());
    }
}
