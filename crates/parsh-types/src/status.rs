//! Exit status of an evaluated command.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The exit status a command evaluation reports back to the scheduler.
///
/// The scheduler never interprets statuses beyond zero/nonzero: zero selects
/// the then-branch / continues a while loop; nonzero selects the else-branch
/// / continues an until loop. Evaluator failures are carried here, never as
/// scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub const SUCCESS: ExitStatus = ExitStatus(0);
    pub const FAILURE: ExitStatus = ExitStatus(1);

    /// True if the status is zero.
    pub fn success(self) -> bool {
        self.0 == 0
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        ExitStatus::SUCCESS
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ExitStatus {
    fn from(code: i32) -> Self {
        ExitStatus(code)
    }
}
