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
    planner::{frame_step_sizes, random_config, step_towards, MotionPlanner},
    rrt::{init_rrt_solutions, Tree},
    spatial::Pose,
};
use rand::{rngs::StdRng, Rng};
use std::sync::{Arc, Mutex};

/// Unidirectional RRT: a single tree grown from the seed until it reaches
/// one of the goal's IK solutions. Carries only the basic planner
/// capability; no look-ahead, no smoothing.
pub struct BasicRrtPlanner {
    frame: Arc<dyn Frame>,
    options: Arc<PlannerOptions>,
    rng: Mutex<StdRng>,
    step_sizes: Config,
}

impl BasicRrtPlanner {
    pub fn new(frame: Arc<dyn Frame>, options: Arc<PlannerOptions>, rng: StdRng) -> Self {
        let step_sizes = frame_step_sizes(frame.as_ref(), options.frame_step_fraction);
        Self {
            frame,
            options,
            rng: Mutex::new(rng),
            step_sizes,
        }
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
}

impl MotionPlanner for BasicRrtPlanner {
    fn options(&self) -> &PlannerOptions {
        &self.options
    }

    fn plan(&self, ctx: &Context, goal: &Pose, seed: &[f64]) -> Result<Vec<Config>, PlanError> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let seeded = init_rrt_solutions(
            ctx,
            self.frame.as_ref(),
            &self.options,
            &mut rng,
            goal,
            seed,
        );
        if seeded.err.is_some() || !seeded.steps.is_empty() {
            return seeded.into_result();
        }

        let distance = &*self.options.distance_func;
        let goals: Vec<Config> = seeded
            .maps
            .goal_tree
            .nodes
            .iter()
            .map(|node| node.q.clone())
            .collect();
        let step_distance = self
            .step_sizes
            .iter()
            .map(|s| s * s)
            .sum::<f64>()
            .sqrt();

        let mut tree = Tree::rooted(seed.iter().copied().collect());
        for _ in 0..self.options.plan_iterations {
            ctx.check()?;
            let target: Config = if rng.gen_bool(self.options.goal_bias.clamp(0.0, 1.0)) {
                goals[rng.gen_range(0..goals.len())].clone()
            } else {
                random_config(self.frame.as_ref(), &mut rng)
            };

            let Some(nearest) = tree.nearest(&target, distance) else {
                continue;
            };
            let new_q = step_towards(&tree.nodes[nearest].q, &target, &self.step_sizes);
            if distance(&tree.nodes[nearest].q, &new_q) < f64::EPSILON
                || !self.segment_valid(&tree.nodes[nearest].q, &new_q)
            {
                continue;
            }
            let cost = tree.nodes[nearest].cost + distance(&tree.nodes[nearest].q, &new_q);
            let new_index = tree.add(new_q.clone(), Some(nearest), cost);

            for goal_q in &goals {
                if distance(&new_q, goal_q) <= step_distance
                    && self.segment_valid(&new_q, goal_q)
                {
                    let mut path = tree.retrace(new_index)?;
                    if path.last() != Some(goal_q) {
                        path.push(goal_q.clone());
                    }
                    return Ok(path);
                }
            }
        }
        Err(PlanError::PlannerFailure(format!(
            "no solution within {} iterations",
            self.options.plan_iterations
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Limit, SerialChain};
    use rand::SeedableRng;
    use std::f64::consts::FRAC_PI_4;

    #[test]
    fn reaches_goal_with_a_single_tree() {
        let frame: Arc<dyn Frame> =
            Arc::new(SerialChain::planar("arm", &[1.0, 1.0], Limit::new(-3.1, 3.1)));
        let options = Arc::new(PlannerOptions::new_basic());
        let planner = BasicRrtPlanner::new(frame.clone(), options, StdRng::seed_from_u64(29));

        let seed = [0.0, 0.0];
        let goal = frame.transform(&[FRAC_PI_4, -FRAC_PI_4]).unwrap();
        let path = planner.plan(&Context::background(), &goal, &seed).unwrap();
        assert!(path.len() >= 2);
        assert_eq!(path[0].as_slice(), &seed[..]);
        let reached = frame.transform(path.last().unwrap()).unwrap();
        let (dt, _) = crate::spatial::pose_delta(&reached, &goal);
        assert!(dt < 1e-4);
    }
}
