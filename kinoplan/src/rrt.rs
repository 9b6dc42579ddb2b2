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
    constraint::DistanceFn,
    context::Context,
    error::PlanError,
    frame::{Config, Frame},
    options::{PlannerOptions, DEFAULT_OPTIMALITY_MULTIPLE},
    spatial::Pose,
};
use rand::rngs::StdRng;

/// One node of a sampling tree: a configuration, a parent link into the
/// arena, and the accumulated cost from the root.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub q: Config,
    pub parent: Option<usize>,
    pub cost: f64,
}

/// A sampling tree stored as a memory arena with index parent links. A tree
/// may carry several roots (the goal tree has one root per IK solution).
#[derive(Debug, Clone, Default)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooted(q: Config) -> Self {
        let mut tree = Self::new();
        tree.add_root(q);
        tree
    }

    pub fn add_root(&mut self, q: Config) -> usize {
        self.add(q, None, 0.0)
    }

    pub fn add(&mut self, q: Config, parent: Option<usize>, cost: f64) -> usize {
        self.nodes.push(TreeNode { q, parent, cost });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the node nearest to `q` under the given distance function.
    pub fn nearest(&self, q: &[f64], distance: &DistanceFn) -> Option<usize> {
        let mut best = None;
        let mut best_distance = f64::INFINITY;
        for (index, node) in self.nodes.iter().enumerate() {
            let d = distance(&node.q, q);
            if d < best_distance {
                best_distance = d;
                best = Some(index);
            }
        }
        best
    }

    /// Indices of all nodes within `radius` of `q`.
    pub fn neighborhood(&self, q: &[f64], radius: f64, distance: &DistanceFn) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| distance(&node.q, q) <= radius)
            .map(|(index, _)| index)
            .collect()
    }

    /// The root-to-node walk of configurations ending at `index`.
    pub fn retrace(&self, index: usize) -> Result<Vec<Config>, PlanError> {
        let mut sequence = Vec::new();
        let mut cursor = Some(index);
        while let Some(current) = cursor {
            let node = self.nodes.get(current).ok_or_else(|| {
                PlanError::Internal(format!(
                    "tree references node [{current}] outside its arena"
                ))
            })?;
            sequence.push(node.q.clone());
            cursor = node.parent;
            if sequence.len() > self.nodes.len() {
                return Err(PlanError::Internal(
                    "tree parent links form a cycle".to_owned(),
                ));
            }
        }
        sequence.reverse();
        Ok(sequence)
    }
}

/// The pair of trees a bidirectional planner grows, plus the IK-derived
/// estimate of the best achievable path cost. Populated once per atomic
/// waypoint and owned by the planner that writes them.
#[derive(Debug, Clone, Default)]
pub struct RrtMaps {
    pub start_tree: Tree,
    pub goal_tree: Tree,

    /// Cost of the straight configuration-space line from the seed to the
    /// cheapest goal IK solution. Non-positive means no usable estimate.
    pub optimal_cost: f64,
}

/// What a planner posts on its solution channel: the path (empty on
/// failure), the maps it grew, and the error if it failed.
#[derive(Default)]
pub struct RrtPlanReturn {
    pub steps: Vec<Config>,
    pub maps: RrtMaps,
    pub err: Option<PlanError>,
}

impl RrtPlanReturn {
    pub fn from_error(err: PlanError) -> Self {
        Self {
            steps: Vec::new(),
            maps: RrtMaps::default(),
            err: Some(err),
        }
    }

    pub fn into_result(self) -> Result<Vec<Config>, PlanError> {
        match self.err {
            Some(err) => Err(err),
            None if self.steps.len() < 2 => Err(PlanError::Internal(
                "planner returned a path with fewer than two configurations".to_owned(),
            )),
            None => Ok(self.steps),
        }
    }
}

/// Seed the maps for one atomic waypoint from goal IK solutions. May solve
/// the problem outright: if the best solution is indistinguishable from the
/// seed the returned steps are the whole plan.
pub fn init_rrt_solutions(
    ctx: &Context,
    frame: &dyn Frame,
    options: &PlannerOptions,
    rng: &mut StdRng,
    goal: &Pose,
    seed: &[f64],
) -> RrtPlanReturn {
    let solutions = match frame.solve_ik(
        ctx,
        goal,
        seed,
        &options.goal_metric,
        rng,
        options.max_ik_solutions,
    ) {
        Ok(solutions) => solutions,
        Err(err) => return RrtPlanReturn::from_error(err),
    };
    // solutions that violate the constraint set cannot terminate a path
    let solutions: Vec<Config> = solutions
        .into_iter()
        .filter(|solution| {
            matches!(options.constraints.check_state(frame, solution), Ok(true))
        })
        .collect();
    if solutions.is_empty() {
        return RrtPlanReturn::from_error(PlanError::UnreachableGoal);
    }

    let seed_config: Config = seed.iter().copied().collect();
    let best_distance = (*options.distance_func)(&seed_config, &solutions[0]);
    if best_distance < options.input_ident_distance {
        return RrtPlanReturn {
            steps: vec![seed_config, solutions[0].clone()],
            maps: RrtMaps::default(),
            err: None,
        };
    }

    let mut maps = RrtMaps {
        start_tree: Tree::rooted(seed_config.clone()),
        goal_tree: Tree::new(),
        optimal_cost: f64::INFINITY,
    };
    for solution in solutions {
        let cost = (*options.distance_func)(&seed_config, &solution);
        maps.optimal_cost = maps.optimal_cost.min(cost);
        maps.goal_tree.add_root(solution);
    }
    RrtPlanReturn {
        steps: Vec::new(),
        maps,
        err: None,
    }
}

/// Cumulative path cost under the given distance function.
pub fn evaluate_plan(steps: &[Config], distance: &DistanceFn) -> f64 {
    steps
        .windows(2)
        .map(|pair| distance(&pair[0], &pair[1]))
        .sum()
}

/// Whether a solution is within the optimality multiple of the IK-derived
/// optimum, and its score. A degenerate (non-positive) optimum makes every
/// solved plan good enough.
pub fn good_plan(result: &RrtPlanReturn, options: &PlannerOptions) -> (bool, f64) {
    if !result.steps.is_empty() {
        if result.maps.optimal_cost <= 0.0 {
            return (true, f64::INFINITY);
        }
        let cost = evaluate_plan(&result.steps, &*options.distance_func);
        if cost < result.maps.optimal_cost * DEFAULT_OPTIMALITY_MULTIPLE {
            return (true, cost);
        }
        return (false, cost);
    }
    (false, f64::INFINITY)
}
