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

use crate::error::PlanError;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// How often a blocked receive re-checks its context for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A cancellation token with an optional deadline, forming parent/child
/// chains. Every planner call runs under a child of the caller's context,
/// additionally bounded by that planner's own timeout. Cancelling a context
/// is observed by all of its descendants; planners poll [`Context::check`]
/// between iterations and unwind promptly.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

impl Context {
    /// A root context that never expires on its own.
    pub fn background() -> Self {
        Self::make(None, None)
    }

    /// A child that shares this context's termination but adds no deadline.
    pub fn child(&self) -> Self {
        Self::make(None, Some(self.clone()))
    }

    /// A child that additionally expires after `seconds`.
    pub fn with_timeout(&self, seconds: f64) -> Self {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        Self::make(Some(deadline), Some(self.clone()))
    }

    fn make(deadline: Option<Instant>, parent: Option<Context>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    /// Cancel this context and, transitively, every child derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// The earliest deadline along the parent chain, if any.
    pub fn deadline(&self) -> Option<Instant> {
        let inherited = self.inner.parent.as_ref().and_then(|p| p.deadline());
        match (self.inner.deadline, inherited) {
            (Some(own), Some(up)) => Some(own.min(up)),
            (own, up) => own.or(up),
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Ok while the context is live. Termination is classified here, at the
    /// point the chain knows which deadline fired: cancellation anywhere on
    /// the chain, or an ancestor's expired deadline, is
    /// [`PlanError::Cancelled`] (the outer context ended); this context's
    /// own expired deadline is a planner failure (the scope it bounds timed
    /// out without a solution). Cancellation takes precedence over expiry.
    pub fn check(&self) -> Result<(), PlanError> {
        if self.is_cancelled() {
            return Err(PlanError::Cancelled);
        }
        let now = Instant::now();
        if let Some(inherited) = self.inner.parent.as_ref().and_then(|p| p.deadline()) {
            if now >= inherited {
                return Err(PlanError::Cancelled);
            }
        }
        if let Some(own) = self.inner.deadline {
            if now >= own {
                return Err(PlanError::PlannerFailure(
                    "timed out before finding a solution".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Block on a channel until a message arrives or this context ends,
    /// whichever happens first. An already-delivered message wins over an
    /// already-ended context. A sender dropped without sending is an
    /// internal error: completion channels must post exactly once.
    pub fn recv<T>(&self, rx: &Receiver<T>) -> Result<T, PlanError> {
        loop {
            match rx.try_recv() {
                Ok(value) => return Ok(value),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(PlanError::Internal(
                        "planner exited without posting a result".to_owned(),
                    ))
                }
            }
            self.check()?;
            let mut until = Instant::now() + POLL_INTERVAL;
            if let Some(deadline) = self.deadline() {
                until = until.min(deadline);
            }
            match rx.recv_deadline(until) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PlanError::Internal(
                        "planner exited without posting a result".to_owned(),
                    ))
                }
            }
        }
    }
}

/// Cancels its context when dropped. Used by the orchestrator so that every
/// in-flight planner observes termination before its thread scope is joined,
/// on success and error paths alike.
pub struct CancelGuard<'a>(pub &'a Context);

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
