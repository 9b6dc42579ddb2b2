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

use crate::{
    context::Context,
    error::PlanError,
    frame::{Config, Frame},
    options::PlannerOptions,
    planner::{
        frame_step_sizes, random_config, shortcut_smooth, step_towards, MotionPlanner,
        RrtParallelPlanner, RrtParallelPlannerShared,
    },
    rrt::{init_rrt_solutions, RrtPlanReturn, Tree},
    spatial::Pose,
};
use crossbeam_channel::bounded;
use log::debug;
use rand::{rngs::StdRng, Rng};
use std::sync::{Arc, Mutex};

/// Constrained bidirectional RRT-Connect. Grows a tree from the seed and a
/// tree from the goal IK solutions, extending both in constrained steps and
/// connecting them where they meet. Every extension step is validated
/// against the full constraint set, so a returned path satisfies the
/// constraints at the option resolution by construction.
pub struct CBiRrtPlanner {
    frame: Arc<dyn Frame>,
    options: Arc<PlannerOptions>,
    rng: Mutex<StdRng>,
    step_sizes: Config,
}

impl CBiRrtPlanner {
    pub fn new(frame: Arc<dyn Frame>, options: Arc<PlannerOptions>, rng: StdRng) -> Self {
        let step_sizes = frame_step_sizes(frame.as_ref(), options.frame_step_fraction);
        Self {
            frame,
            options,
            rng: Mutex::new(rng),
            step_sizes,
        }
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Extend a tree from `from` toward `target` in per-joint bounded
    /// steps, stopping at the first constraint violation or when the target
    /// is reached. Returns the index of the last node added (or `from` if
    /// no step was possible).
    fn constrained_extend(
        &self,
        ctx: &Context,
        tree: &mut Tree,
        from: usize,
        target: &[f64],
    ) -> usize {
        let distance = &*self.options.distance_func;
        let mut current = from;
        loop {
            if ctx.is_done() {
                return current;
            }
            let q = tree.nodes[current].q.clone();
            let remaining = distance(&q, target);
            if remaining < self.options.input_ident_distance {
                return current;
            }
            let next = step_towards(&q, target, &self.step_sizes);
            if distance(&next, target) >= remaining {
                // numerically unable to make progress
                return current;
            }
            match self.options.constraints.check_segment(
                self.frame.as_ref(),
                &q,
                &next,
                self.options.resolution,
            ) {
                Ok(true) => {}
                _ => return current,
            }
            let cost = tree.nodes[current].cost + distance(&q, &next);
            current = tree.add(next, Some(current), cost);
        }
    }

    fn run(
        &self,
        ctx: &Context,
        shared: &mut RrtParallelPlannerShared,
    ) -> Result<Vec<Config>, PlanError> {
        let distance = &*self.options.distance_func;
        if shared.maps.start_tree.is_empty() || shared.maps.goal_tree.is_empty() {
            return Err(PlanError::Internal(
                "bidirectional planner started with unseeded maps".to_owned(),
            ));
        }

        let mut rng = self.rng();
        for iteration in 0..self.options.plan_iterations {
            ctx.check()?;

            let target: Config =
                if rng.gen_bool(self.options.goal_bias.clamp(0.0, 1.0)) {
                    let pick = rng.gen_range(0..shared.maps.goal_tree.len());
                    shared.maps.goal_tree.nodes[pick].q.clone()
                } else {
                    random_config(self.frame.as_ref(), &mut rng)
                };

            let nearest_start = shared
                .maps
                .start_tree
                .nearest(&target, distance)
                .unwrap_or(0);
            let reached_start =
                self.constrained_extend(ctx, &mut shared.maps.start_tree, nearest_start, &target);
            let qa = shared.maps.start_tree.nodes[reached_start].q.clone();

            let nearest_goal = shared.maps.goal_tree.nearest(&qa, distance).unwrap_or(0);
            let reached_goal =
                self.constrained_extend(ctx, &mut shared.maps.goal_tree, nearest_goal, &qa);
            let qb = shared.maps.goal_tree.nodes[reached_goal].q.clone();

            if distance(&qa, &qb) < self.options.input_ident_distance {
                debug!(
                    "trees connected after {} iterations ({} + {} nodes)",
                    iteration + 1,
                    shared.maps.start_tree.len(),
                    shared.maps.goal_tree.len(),
                );
                let mut path = shared.maps.start_tree.retrace(reached_start)?;
                let mut tail = shared.maps.goal_tree.retrace(reached_goal)?;
                tail.reverse();
                if tail.first() == path.last() {
                    tail.remove(0);
                }
                path.extend(tail);
                if path.len() < 2 {
                    return Err(PlanError::Internal(
                        "connected trees produced a degenerate path".to_owned(),
                    ));
                }
                return Ok(path);
            }
        }
        Err(PlanError::PlannerFailure(format!(
            "no solution within {} iterations",
            self.options.plan_iterations
        )))
    }
}

impl MotionPlanner for CBiRrtPlanner {
    fn options(&self) -> &PlannerOptions {
        &self.options
    }

    fn plan(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> Result<Vec<Config>, PlanError> {
        // everything, IK seeding included, runs under this planner's own
        // deadline; the caller's termination is inherited through it
        let plan_ctx = ctx.with_timeout(self.options.timeout);
        let seeded = self.seed_solutions(&plan_ctx, goal, seed);
        if seeded.err.is_some() || !seeded.steps.is_empty() {
            return seeded.into_result();
        }
        let (solution_tx, solution_rx) = bounded(1);
        self.background_run(
            &plan_ctx,
            goal,
            seed,
            RrtParallelPlannerShared {
                maps: seeded.maps,
                endpoint_preview: None,
                solution: solution_tx,
            },
        );
        plan_ctx.recv(&solution_rx)?.into_result()
    }
}

impl RrtParallelPlanner for CBiRrtPlanner {
    fn background_run(
        &self,
        ctx: &Context,
        _goal: &Pose,
        _seed: &[f64],
        mut shared: RrtParallelPlannerShared,
    ) {
        let result = self.run(ctx, &mut shared);
        let RrtParallelPlannerShared {
            maps,
            endpoint_preview,
            solution,
        } = shared;
        let message = match result {
            Ok(steps) => {
                if let Some(preview) = endpoint_preview {
                    if let Some(endpoint) = steps.last() {
                        let _ = preview.send(endpoint.clone());
                    }
                }
                RrtPlanReturn {
                    steps,
                    maps,
                    err: None,
                }
            }
            Err(err) => RrtPlanReturn {
                steps: Vec::new(),
                maps,
                err: Some(err),
            },
        };
        let _ = solution.send(message);
    }

    fn seed_solutions(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> RrtPlanReturn {
        let mut rng = self.rng();
        init_rrt_solutions(ctx, self.frame.as_ref(), &self.options, &mut rng, goal, seed)
    }

    fn smooth(&self, ctx: &Context, steps: Vec<Config>) -> Vec<Config> {
        let mut rng = self.rng();
        shortcut_smooth(ctx, self.frame.as_ref(), &self.options, &mut rng, steps)
    }
}
