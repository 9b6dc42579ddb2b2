/*
 * Copyright (C) 2022 Open Source Robotics Foundation
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
*/

pub use std::error::Error as StdError;
pub use thiserror::Error as ThisError;

/// Errors that can arise while resolving configurations against a frame.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame system has no frame named [{0}]")]
    UnknownFrame(String),

    #[error("frame [{frame}] expects {expected} inputs but received {received}")]
    InputMismatch {
        frame: String,
        expected: usize,
        received: usize,
    },

    #[error("input {value} for joint {joint} is outside its limits [{min}, {max}]")]
    OutOfLimits {
        joint: usize,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// The error surface of a plan request. The first error observed ends the
/// whole request; no partial path is ever returned.
#[derive(ThisError, Debug)]
pub enum PlanError {
    /// The request could not be interpreted: an unresolvable seed map, an
    /// unparseable option value, or a malformed options chain. Reported
    /// before any planner runs.
    #[error("invalid planning request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The viability check found no inverse kinematics solutions for the
    /// goal. Reported before any sub-planning starts.
    #[error("unable to solve for position: no inverse kinematics solutions for goal")]
    UnreachableGoal,

    /// A sampling planner returned an error or timed out without a
    /// solution, and no fallback produced one. A planner's own expired
    /// deadline surfaces here.
    #[error("planner failed to find a solution: {0}")]
    PlannerFailure(String),

    /// The outer context ended before planning completed, by cancellation
    /// or by the whole-request deadline. Every in-flight planner returns
    /// this.
    #[error("plan request was cancelled")]
    Cancelled,

    /// An invariant was violated, e.g. a planner returned an empty path.
    /// Never retried.
    #[error("internal planning error: {0}")]
    Internal(String),

    /// Wrapper applied when a multi-waypoint request failed after its goal
    /// was confirmed reachable.
    #[error("failed to plan path for valid goal: {0}")]
    ValidGoal(#[source] Box<PlanError>),
}

impl PlanError {
    /// Whether this error came from the caller's context ending rather
    /// than the planning problem itself.
    pub fn is_termination(&self) -> bool {
        matches!(self, PlanError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_failure_keeps_inner_message() {
        let inner = PlanError::PlannerFailure("ran out of iterations".to_owned());
        let wrapped = PlanError::ValidGoal(Box::new(inner));
        let message = format!("{wrapped}");
        assert!(message.starts_with("failed to plan path for valid goal"));
        assert!(message.contains("ran out of iterations"));
    }

    #[test]
    fn termination_errors_are_recognized() {
        assert!(PlanError::Cancelled.is_termination());
        assert!(!PlanError::PlannerFailure("out of iterations".to_owned()).is_termination());
        assert!(!PlanError::UnreachableGoal.is_termination());
    }
}
