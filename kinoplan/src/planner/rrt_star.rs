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
    rrt::{evaluate_plan, init_rrt_solutions, RrtPlanReturn, Tree},
    spatial::Pose,
};
use crossbeam_channel::bounded;
use log::debug;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};

/// Stop refining once the best solution is within this factor of the
/// IK-derived optimum.
const NEAR_OPTIMAL_FACTOR: f64 = 1.1;

/// Bidirectional RRT*-Connect: both trees extend toward uniform samples
/// with neighborhood rewiring, and meet where a sample lands within one
/// step of both. Keeps refining until its deadline or iteration budget runs
/// out, then returns the cheapest connection found.
pub struct RrtStarConnectPlanner {
    frame: Arc<dyn Frame>,
    options: Arc<PlannerOptions>,
    rng: Mutex<StdRng>,
    step_sizes: Config,

    /// One RRT* extension step, as a distance under the option metric.
    step_distance: f64,
}

impl RrtStarConnectPlanner {
    pub fn new(frame: Arc<dyn Frame>, options: Arc<PlannerOptions>, rng: StdRng) -> Self {
        let step_sizes = frame_step_sizes(frame.as_ref(), options.frame_step_fraction);
        let step_distance = step_sizes.iter().map(|s| s * s).sum::<f64>().sqrt();
        Self {
            frame,
            options,
            rng: Mutex::new(rng),
            step_sizes,
            step_distance,
        }
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn segment_valid(&self, from: &[f64], to: &[f64]) -> bool {
        matches!(
            self.options.constraints.check_segment(
                self.frame.as_ref(),
                from,
                to,
                self.options.resolution,
            ),
            Ok(true)
        )
    }

    /// RRT* extension: steer the nearest node toward the sample, pick the
    /// cheapest valid parent in the neighborhood, then rewire neighbors
    /// through the new node where that lowers their cost. Stored costs are
    /// used for parent selection only; final scoring retraces the path.
    fn extend(&self, tree: &mut Tree, sample: &[f64]) -> Option<usize> {
        let distance = &*self.options.distance_func;
        let nearest = tree.nearest(sample, distance)?;
        let new_q = step_towards(&tree.nodes[nearest].q, sample, &self.step_sizes);
        if distance(&tree.nodes[nearest].q, &new_q) < f64::EPSILON {
            return None;
        }

        let neighborhood =
            tree.neighborhood(&new_q, self.step_distance * 2.0, distance);
        let mut parent = None;
        let mut parent_cost = f64::INFINITY;
        for candidate in neighborhood.iter().copied().chain([nearest]) {
            let through = tree.nodes[candidate].cost + distance(&tree.nodes[candidate].q, &new_q);
            if through < parent_cost && self.segment_valid(&tree.nodes[candidate].q, &new_q) {
                parent = Some(candidate);
                parent_cost = through;
            }
        }
        let parent = parent?;
        let new_index = tree.add(new_q.clone(), Some(parent), parent_cost);

        for neighbor in neighborhood {
            if neighbor == parent {
                continue;
            }
            let rewired = parent_cost + distance(&new_q, &tree.nodes[neighbor].q);
            if rewired < tree.nodes[neighbor].cost
                && self.segment_valid(&new_q, &tree.nodes[neighbor].q)
            {
                tree.nodes[neighbor].parent = Some(new_index);
                tree.nodes[neighbor].cost = rewired;
            }
        }
        Some(new_index)
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
        let mut best: Option<(Vec<Config>, f64)> = None;
        let optimal = shared.maps.optimal_cost;

        for iteration in 0..self.options.plan_iterations {
            match ctx.check() {
                Ok(()) => {}
                Err(err @ PlanError::Cancelled) => return Err(err),
                // own deadline: the refinement budget is spent, emit the
                // best connection found
                Err(_) => break,
            }
            let sample = random_config(self.frame.as_ref(), &mut rng);

            let reached_start = self.extend(&mut shared.maps.start_tree, &sample);
            let reached_goal = self.extend(&mut shared.maps.goal_tree, &sample);
            let (Some(a), Some(b)) = (reached_start, reached_goal) else {
                continue;
            };

            let qa = shared.maps.start_tree.nodes[a].q.clone();
            let qb = shared.maps.goal_tree.nodes[b].q.clone();
            if distance(&qa, &qb) > self.step_distance || !self.segment_valid(&qa, &qb) {
                continue;
            }

            let mut path = shared.maps.start_tree.retrace(a)?;
            let mut tail = shared.maps.goal_tree.retrace(b)?;
            tail.reverse();
            if tail.first() == path.last() {
                tail.remove(0);
            }
            path.extend(tail);
            let cost = evaluate_plan(&path, distance);
            if best.as_ref().map_or(true, |(_, c)| cost < *c) {
                debug!("solution with cost {cost} at iteration {iteration}");
                best = Some((path, cost));
            }
            if optimal > 0.0 && cost < optimal * NEAR_OPTIMAL_FACTOR {
                break;
            }
        }

        match best {
            Some((path, _)) if path.len() >= 2 => Ok(path),
            _ => Err(PlanError::PlannerFailure(
                "no tree connection within the iteration and time budget".to_owned(),
            )),
        }
    }
}

impl MotionPlanner for RrtStarConnectPlanner {
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

impl RrtParallelPlanner for RrtStarConnectPlanner {
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
