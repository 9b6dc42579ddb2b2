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

pub mod basic_rrt;
pub use basic_rrt::BasicRrtPlanner;

pub mod cbirrt;
pub use cbirrt::CBiRrtPlanner;

pub mod rrt_star;
pub use rrt_star::RrtStarConnectPlanner;

use crate::{
    context::Context,
    error::PlanError,
    frame::{Config, Frame},
    options::{PlannerConstructor, PlannerOptions},
    rrt::{evaluate_plan, RrtMaps, RrtPlanReturn},
    spatial::Pose,
};
use crossbeam_channel::Sender;
use rand::{rngs::StdRng, Rng};
use std::sync::Arc;

/// The basic planner capability: plan one goal from one seed.
pub trait MotionPlanner: Send + Sync {
    fn options(&self) -> &PlannerOptions;

    fn plan(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> Result<Vec<Config>, PlanError>;
}

/// State shared between the atomic-waypoint driver and a parallel planner's
/// background run: the trees to grow, an endpoint-preview slot, and the
/// completion channel the planner posts to exactly once.
pub struct RrtParallelPlannerShared {
    pub maps: RrtMaps,

    /// Capacity-1. Posted at most once, as soon as the terminal
    /// configuration of the plan is known, strictly before the solution.
    pub endpoint_preview: Option<Sender<Config>>,

    /// Capacity-1. Posted exactly once on termination, success or failure.
    pub solution: Sender<RrtPlanReturn>,
}

/// The richer capability set: solution look-ahead for pipelined waypoints,
/// map seeding, and path smoothing.
pub trait RrtParallelPlanner: MotionPlanner {
    /// Grow the shared maps toward the goal, posting per the
    /// [`RrtParallelPlannerShared`] contract. Never blocks the caller's
    /// channel: both channels have room for the single message.
    fn background_run(&self, ctx: &Context, goal: &Pose, seed: &[f64], shared: RrtParallelPlannerShared);

    /// Populate maps for this goal from IK solutions, or solve trivially.
    fn seed_solutions(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> RrtPlanReturn;

    /// Shortcut-smooth a path. Endpoints are preserved; every spliced
    /// segment is re-validated against the full constraint set.
    fn smooth(&self, ctx: &Context, steps: Vec<Config>) -> Vec<Config>;
}

/// A planner tagged by capability. The manager detects capability once per
/// atomic waypoint with a `match`, not reflection. The trait objects are
/// shared so background execution units can hold their own handle.
pub enum PathPlanner {
    Parallel(Arc<dyn RrtParallelPlanner>),
    Basic(Arc<dyn MotionPlanner>),
}

impl PathPlanner {
    /// Construct the planner selected by `options.constructor`.
    pub fn build(frame: Arc<dyn Frame>, options: Arc<PlannerOptions>, rng: StdRng) -> Self {
        match options.constructor {
            PlannerConstructor::CBiRRT => {
                PathPlanner::Parallel(Arc::new(CBiRrtPlanner::new(frame, options, rng)))
            }
            PlannerConstructor::RRTStarConnect => {
                PathPlanner::Parallel(Arc::new(RrtStarConnectPlanner::new(frame, options, rng)))
            }
            PlannerConstructor::BasicRRT => {
                PathPlanner::Basic(Arc::new(BasicRrtPlanner::new(frame, options, rng)))
            }
        }
    }

    pub fn options(&self) -> &PlannerOptions {
        match self {
            PathPlanner::Parallel(planner) => planner.options(),
            PathPlanner::Basic(planner) => planner.options(),
        }
    }

    pub fn plan(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> Result<Vec<Config>, PlanError> {
        match self {
            PathPlanner::Parallel(planner) => planner.plan(ctx, goal, seed),
            PathPlanner::Basic(planner) => planner.plan(ctx, goal, seed),
        }
    }
}

/// Per-joint extension step sizes: a fixed fraction of each joint's range.
pub(crate) fn frame_step_sizes(frame: &dyn Frame, fraction: f64) -> Config {
    frame
        .limits()
        .iter()
        .map(|limit| (limit.span() * fraction).max(1e-6))
        .collect()
}

/// Uniform sample within the frame's joint limits.
pub(crate) fn random_config(frame: &dyn Frame, rng: &mut StdRng) -> Config {
    frame
        .limits()
        .iter()
        .map(|limit| rng.gen_range(limit.min..=limit.max))
        .collect()
}

/// One step from `from` toward `to`, each joint moving at most its step
/// size. Reaches `to` exactly once every joint is within its step.
pub(crate) fn step_towards(from: &[f64], to: &[f64], step_sizes: &[f64]) -> Config {
    from.iter()
        .zip(to.iter())
        .zip(step_sizes.iter())
        .map(|((f, t), step)| {
            let delta = t - f;
            if delta.abs() <= *step {
                *t
            } else {
                f + delta.signum() * step
            }
        })
        .collect()
}

/// Random shortcut smoothing. Picks segment endpoints (uniformly, or within
/// a local window to clean up corners), verifies the direct segment against
/// the constraint set, and splices it in when it is strictly shorter.
pub(crate) fn shortcut_smooth(
    ctx: &Context,
    frame: &dyn Frame,
    options: &PlannerOptions,
    rng: &mut StdRng,
    mut steps: Vec<Config>,
) -> Vec<Config> {
    const MIN_IMPROVEMENT: f64 = 1e-9;

    for _ in 0..options.smooth_iterations {
        if steps.len() < 3 || ctx.is_done() {
            break;
        }
        let (start, finish) = if rng.gen_bool(options.smooth_swap_probability.clamp(0.0, 1.0)) {
            let start = rng.gen_range(0..steps.len() - 2);
            let span = options.smooth_window.max(2).min(steps.len() - 1 - start);
            if span < 2 {
                continue;
            }
            (start, start + rng.gen_range(2..=span))
        } else {
            let a = rng.gen_range(0..steps.len());
            let b = rng.gen_range(0..steps.len());
            (a.min(b), a.max(b))
        };
        if finish <= start + 1 {
            continue;
        }

        let current = evaluate_plan(&steps[start..=finish], &*options.distance_func);
        let direct = (*options.distance_func)(&steps[start], &steps[finish]);
        if direct + MIN_IMPROVEMENT >= current {
            continue;
        }
        match options.constraints.check_segment(
            frame,
            &steps[start],
            &steps[finish],
            options.resolution,
        ) {
            Ok(true) => {
                steps.drain(start + 1..finish);
            }
            _ => continue,
        }
    }
    steps
}
