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
    constraint::{
        absolute_linear_constraint, obstacle_constraint, position_only_metric,
        proportional_linear_constraint, self_collision_constraint, slerp_orientation_constraint,
        LINEAR_CONSTRAINT, OBSTACLE_CONSTRAINT, ORIENTATION_CONSTRAINT, PSEUDOLINEAR_CONSTRAINT,
        SELF_COLLISION_CONSTRAINT,
    },
    context::{CancelGuard, Context},
    error::PlanError,
    frame::{Config, Frame, FrameSystem, PoseInFrame, SeedMap, StaticFrameSystem, WORLD_FRAME},
    options::{
        f64_from_config, planning_alg_from_config, MotionProfile, PlannerConstructor,
        PlannerOptions, DEFAULT_FALLBACK_TIMEOUT, DEFAULT_LINEAR_DEVIATION,
        DEFAULT_ORIENTATION_DEVIATION, DEFAULT_PATH_STEP_SIZE, DEFAULT_PSEUDOLINEAR_TOLERANCE,
    },
    planner::{PathPlanner, RrtParallelPlanner, RrtParallelPlannerShared},
    rrt::{evaluate_plan, good_plan, RrtMaps, RrtPlanReturn},
    spatial::{interpolate, path_step_count, Pose},
    world::WorldState,
};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use log::{debug, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{Map, Value};
use std::{
    mem,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

/// How long the atomic driver's select sleeps between context re-checks.
const SELECT_POLL: Duration = Duration::from_millis(10);

/// A future plan result: either already materialised, or a capacity-1
/// channel a parallel planner will post to. Constructed by the atomic
/// driver, consumed by the orchestrator in submission order.
pub enum ResultPromise {
    Ready(Vec<Config>),
    Pending(Receiver<RrtPlanReturn>),
}

impl ResultPromise {
    pub fn result(self, ctx: &Context) -> Result<Vec<Config>, PlanError> {
        match self {
            ResultPromise::Ready(steps) => Ok(steps),
            ResultPromise::Pending(rx) => ctx.recv(&rx)?.into_result(),
        }
    }
}

/// The single entry point to the sampling planners: decomposes goals into
/// atomic waypoints, wires options and constraints, pipelines the waypoint
/// planners, and handles fallback racing and smoothing.
pub struct PlanManager {
    frame: Arc<dyn Frame>,
    frame_system: Arc<dyn FrameSystem>,
    rng: Mutex<StdRng>,
}

impl PlanManager {
    pub fn new(frame: Arc<dyn Frame>, frame_system: Arc<dyn FrameSystem>, seed: u64) -> Self {
        Self {
            frame,
            frame_system,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// A manager for a frame whose goals are already in world coordinates.
    pub fn new_world_rooted(frame: Arc<dyn Frame>, seed: u64) -> Self {
        Self::new(frame, Arc::new(StaticFrameSystem::new()), seed)
    }

    /// Plan the solver frame to one user-visible pose. Decomposes a linear
    /// motion profile into sub-waypoints; everything else plans as a single
    /// atomic waypoint. Constraints hold for the entire motion.
    pub fn plan_single_waypoint(
        &self,
        ctx: &Context,
        seed_map: &SeedMap,
        goal_pose: Pose,
        world: &WorldState,
        motion_config: &Map<String, Value>,
    ) -> Result<Vec<Config>, PlanError> {
        let seed = self.frame.map_to_slice(seed_map)?;
        let mut seed_pose = self.frame.transform(&seed)?;

        // deadline for the entire planning process if specified; it lives
        // on a parent context, so everything below observes its expiry as
        // the outer context ending
        let ctx = match f64_from_config(motion_config, "timeout")? {
            Some(timeout) => ctx.with_timeout(timeout).child(),
            None => ctx.child(),
        };

        // translate the goal into world coordinates if it arrived in
        // another frame
        let mut goal_pose = goal_pose;
        if self.frame.world_rooted() {
            goal_pose = self
                .frame_system
                .transform_pose(
                    seed_map,
                    &PoseInFrame::new(self.frame.goal_frame(), goal_pose),
                    WORLD_FRAME,
                )?
                .pose;
        }

        let mut goals = Vec::new();
        let mut opts = Vec::new();

        // the linear profile has known intermediate poses, so solving can
        // be broken up and pipelined
        let profile = MotionProfile::from_config(motion_config)?;
        if profile == MotionProfile::Linear {
            let step_size = f64_from_config(motion_config, "path_step_size")?
                .unwrap_or(DEFAULT_PATH_STEP_SIZE);
            let steps = path_step_count(&seed_pose, &goal_pose, step_size);

            let mut from = seed_pose;
            for step in 1..steps {
                let by = step as f64 / steps as f64;
                let to = interpolate(&seed_pose, &goal_pose, by);
                goals.push(to);
                opts.push(self.plan_setup_from_move_request(
                    &from,
                    &to,
                    seed_map,
                    world,
                    motion_config,
                )?);
                from = to;
            }
            seed_pose = from;
        }
        goals.push(goal_pose);
        opts.push(self.plan_setup_from_move_request(
            &seed_pose,
            &goal_pose,
            seed_map,
            world,
            motion_config,
        )?);

        // one planner per atomic waypoint, each with its own random source
        let mut planners = Vec::with_capacity(opts.len());
        for opt in opts {
            Self::ensure_fallback_depth(&opt)?;
            let rng = self.derive_rng(&opt);
            planners.push(PathPlanner::build(self.frame.clone(), Arc::new(opt), rng));
        }

        // viability check: with multiple sub-waypoints, make sure the final
        // goal is reachable at all before any sub-planning starts
        if goals.len() > 1 {
            if let Some(final_options) = planners.last().map(PathPlanner::options) {
                let solutions = {
                    let mut rng = self.rng();
                    self.frame.solve_ik(
                        &ctx,
                        &goal_pose,
                        &seed,
                        &final_options.goal_metric,
                        &mut rng,
                        final_options.max_ik_solutions,
                    )?
                };
                if solutions.is_empty() {
                    return Err(PlanError::UnreachableGoal);
                }
            }
        }

        match self.plan_atomic_waypoints(&ctx, &goals, seed, &planners) {
            Ok(steps) => Ok(steps),
            Err(err) if goals.len() > 1 => Err(PlanError::ValidGoal(Box::new(err))),
            Err(err) => Err(err),
        }
    }

    /// The pipeline orchestrator. Waypoints are submitted in path order;
    /// the planner for waypoint i+1 starts as soon as waypoint i commits to
    /// an endpoint. Promises are awaited in submission order; the first
    /// error fails the whole plan and cancels everything in flight.
    fn plan_atomic_waypoints(
        &self,
        ctx: &Context,
        goals: &[Pose],
        seed: Config,
        planners: &[PathPlanner],
    ) -> Result<Vec<Config>, PlanError> {
        let ctx = ctx.child();
        thread::scope(|scope| {
            // dropped before the scope joins, so in-flight planners observe
            // termination on every exit path
            let _guard = CancelGuard(&ctx);

            let mut promises = Vec::with_capacity(goals.len());
            let mut seed = seed;
            for (goal, planner) in goals.iter().zip(planners) {
                ctx.check()?;
                let (next_seed, promise) =
                    self.plan_single_atomic_waypoint(scope, &ctx, goal, seed, planner, None)?;
                seed = next_seed;
                promises.push(promise);
            }

            let mut steps = Vec::new();
            for promise in promises {
                steps.extend(promise.result(&ctx)?);
            }
            Ok(steps)
        })
    }

    /// The atomic-waypoint driver. A parallel-capable planner runs in the
    /// background with solution look-ahead: the returned seed comes from
    /// the endpoint preview when available, letting the next waypoint start
    /// before this one finishes. A basic planner runs synchronously under
    /// its own timeout.
    fn plan_single_atomic_waypoint<'scope, 'env>(
        &'env self,
        scope: &'scope thread::Scope<'scope, 'env>,
        ctx: &Context,
        goal: &Pose,
        seed: Config,
        planner: &PathPlanner,
        maps: Option<RrtMaps>,
    ) -> Result<(Config, ResultPromise), PlanError> {
        match planner {
            PathPlanner::Parallel(parallel) => {
                let (preview_tx, preview_rx) = bounded(1);
                let (solution_tx, solution_rx) = bounded(1);
                {
                    let parallel = Arc::clone(parallel);
                    let ctx = ctx.clone();
                    let goal = *goal;
                    let seed = seed.clone();
                    scope.spawn(move || {
                        self.plan_parallel_rrt_motion(
                            scope,
                            &ctx,
                            &goal,
                            &seed,
                            parallel,
                            Some(preview_tx),
                            solution_tx,
                            maps,
                        );
                    });
                }

                loop {
                    ctx.check()?;
                    match solution_rx.try_recv() {
                        Ok(finished) => {
                            let steps = finished.into_result()?;
                            let next_seed = steps.last().cloned().ok_or_else(|| {
                                PlanError::Internal("planner returned an empty path".to_owned())
                            })?;
                            return Ok((next_seed, ResultPromise::Ready(steps)));
                        }
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => {
                            return Err(PlanError::Internal(
                                "planner exited without posting a result".to_owned(),
                            ));
                        }
                    }
                    // the preview may never arrive; the solution channel
                    // covers that case
                    if let Ok(next_seed) = preview_rx.try_recv() {
                        return Ok((next_seed, ResultPromise::Pending(solution_rx)));
                    }
                    thread::sleep(SELECT_POLL);
                }
            }
            PathPlanner::Basic(basic) => {
                // this context exists exclusively to run and time out the
                // planner
                let plan_ctx = ctx.with_timeout(basic.options().timeout);
                let steps = basic.plan(&plan_ctx, goal, &seed)?;
                let next_seed = steps.last().cloned().ok_or_else(|| {
                    PlanError::Internal("planner returned an empty path".to_owned())
                })?;
                Ok((next_seed, ResultPromise::Ready(steps)))
            }
        }
    }

    /// Plan one atomic waypoint with a parallel-capable planner, racing the
    /// fallback when the primary's result is not good enough. Posts exactly
    /// one message on `solution`.
    #[allow(clippy::too_many_arguments)]
    fn plan_parallel_rrt_motion<'scope, 'env>(
        &'env self,
        scope: &'scope thread::Scope<'scope, 'env>,
        ctx: &Context,
        goal: &Pose,
        seed: &Config,
        planner: Arc<dyn RrtParallelPlanner>,
        mut endpoint_preview: Option<Sender<Config>>,
        solution: Sender<RrtPlanReturn>,
        maps: Option<RrtMaps>,
    ) {
        // seed the maps with IK solutions unless pre-seeded maps were
        // supplied; this may solve the problem outright
        let maps = match maps {
            Some(maps) => maps,
            None => {
                let seeded = planner.seed_solutions(ctx, goal, seed);
                if seeded.err.is_some() || !seeded.steps.is_empty() {
                    let _ = solution.send(seeded);
                    return;
                }
                seeded.maps
            }
        };

        // a lone IK solution fixes the endpoint before planning even
        // starts; publish it so the next waypoint can begin
        if maps.goal_tree.len() == 1 {
            if let Some(preview) = endpoint_preview.take() {
                debug!("only one IK solution, previewing endpoint");
                let _ = preview.send(maps.goal_tree.nodes[0].q.clone());
            }
        }

        // this context exists exclusively to run and time out the planner
        let plan_ctx = ctx.with_timeout(planner.options().timeout);
        let (planner_tx, planner_rx) = bounded(1);
        {
            let planner = Arc::clone(&planner);
            let plan_ctx = plan_ctx.clone();
            let goal = *goal;
            let seed = seed.clone();
            scope.spawn(move || {
                planner.background_run(
                    &plan_ctx,
                    &goal,
                    &seed,
                    RrtParallelPlannerShared {
                        maps,
                        endpoint_preview,
                        solution: planner_tx,
                    },
                );
            });
        }

        let mut final_steps = match ctx.recv(&planner_rx) {
            Ok(finished) => finished,
            Err(err) => {
                let _ = solution.send(RrtPlanReturn::from_error(err));
                return;
            }
        };

        // build the fallback planner if one is configured
        let mut fallback_planner = planner.options().fallback.as_ref().map(|fallback| {
            let rng = self.derive_rng(planner.options());
            PathPlanner::build(self.frame.clone(), Arc::new((**fallback).clone()), rng)
        });

        // pre-seeded maps for the fallback; a connected but inadequate tree
        // is discarded so the fallback starts from scratch
        let mut map_seed = None;
        if final_steps.err.is_none() {
            if fallback_planner.is_some() {
                let (good, score) = good_plan(&final_steps, planner.options());
                if good {
                    debug!(
                        "got path with score {score}, close enough to optimal {}",
                        final_steps.maps.optimal_cost
                    );
                    fallback_planner = None;
                } else {
                    debug!(
                        "path with score {score} not close enough to optimal {}, falling back",
                        final_steps.maps.optimal_cost
                    );
                }
            }
        } else if fallback_planner.is_some() {
            map_seed = Some(mem::take(&mut final_steps.maps));
        }

        // start smoothing before the fallback so both run simultaneously
        let (smooth_tx, smooth_rx) = bounded(1);
        {
            let planner = Arc::clone(&planner);
            let ctx = ctx.clone();
            let steps = mem::take(&mut final_steps.steps);
            scope.spawn(move || {
                let _ = smooth_tx.send(planner.smooth(&ctx, steps));
            });
        }

        // the fallback is an improvement attempt, not a required run; its
        // errors are suppressed in favor of the primary's result
        let mut alternate = None;
        if let Some(fallback) = &fallback_planner {
            match self.plan_single_atomic_waypoint(
                scope,
                ctx,
                goal,
                seed.clone(),
                fallback,
                map_seed,
            ) {
                Ok((_, promise)) => alternate = Some(promise),
                Err(err) => debug!("fallback planner failed to start: {err}"),
            }
        }

        // receive the smoothed primary and re-score it
        if let Ok(smoothed) = smooth_rx.recv() {
            final_steps.steps = smoothed;
        }
        let (_, score) = good_plan(&final_steps, planner.options());

        // the fallback emerges pre-smoothed; keep it only when strictly
        // better than the smoothed primary
        if let Some(promise) = alternate {
            match promise.result(ctx) {
                Ok(alternate_steps) => {
                    let alternate_cost =
                        evaluate_plan(&alternate_steps, &*planner.options().distance_func);
                    if alternate_cost < score {
                        debug!("replacing path with score {score} with better score {alternate_cost}");
                        final_steps = RrtPlanReturn {
                            steps: alternate_steps,
                            maps: RrtMaps::default(),
                            err: None,
                        };
                    } else {
                        debug!(
                            "fallback path with score {alternate_cost} worse than original score {score}; using original"
                        );
                    }
                }
                Err(err) => debug!("fallback planner failed: {err}"),
            }
        }

        let _ = solution.send(final_steps);
    }

    /// Build the options for one atomic move from the untyped motion
    /// configuration: base collision constraints, numeric overrides,
    /// explicit algorithm selection, profile additions, and the automatic
    /// try-RRT*-first bundle when no algorithm was chosen.
    fn plan_setup_from_move_request(
        &self,
        from: &Pose,
        to: &Pose,
        seed_map: &SeedMap,
        world: &WorldState,
        planning_opts: &Map<String, Value>,
    ) -> Result<PlannerOptions, PlanError> {
        let mut opt = PlannerOptions::new_basic();

        let seed = self.frame.map_to_slice(seed_map)?;
        opt.constraints.add_constraint(
            OBSTACLE_CONSTRAINT,
            obstacle_constraint(self.frame.clone(), world, &seed)?,
        );
        opt.constraints.add_constraint(
            SELF_COLLISION_CONSTRAINT,
            self_collision_constraint(self.frame.clone(), &seed)?,
        );

        let profile = MotionProfile::from_config(planning_opts)?;
        opt.apply_config(planning_opts)?;

        let explicit_alg = planning_alg_from_config(planning_opts)?;
        if let Some(alg) = explicit_alg {
            opt.constructor = alg;
            if alg == PlannerConstructor::RRTStarConnect {
                // no motion profiles for RRT*
                if matches!(
                    profile,
                    MotionProfile::Linear | MotionProfile::Pseudolinear | MotionProfile::Orientation
                ) {
                    warn!(
                        "{} profile constraints are not applied when planning_alg is rrtstar",
                        profile.as_str()
                    );
                }
                return Ok(opt);
            }
        }

        match profile {
            MotionProfile::Linear => {
                let line_tolerance = f64_from_config(planning_opts, "line_tolerance")?
                    .unwrap_or(DEFAULT_LINEAR_DEVIATION);
                let orient_tolerance = f64_from_config(planning_opts, "orient_tolerance")?
                    .unwrap_or(DEFAULT_LINEAR_DEVIATION);
                let (constraint, path_metric) =
                    absolute_linear_constraint(from, to, line_tolerance, orient_tolerance);
                opt.constraints.add_constraint(LINEAR_CONSTRAINT, constraint);
                opt.path_metric = Some(path_metric);
            }
            MotionProfile::Pseudolinear => {
                let tolerance = f64_from_config(planning_opts, "tolerance")?
                    .unwrap_or(DEFAULT_PSEUDOLINEAR_TOLERANCE);
                let (constraint, path_metric) =
                    proportional_linear_constraint(from, to, tolerance);
                opt.constraints
                    .add_constraint(PSEUDOLINEAR_CONSTRAINT, constraint);
                opt.path_metric = Some(path_metric);
            }
            MotionProfile::Orientation => {
                let tolerance = f64_from_config(planning_opts, "tolerance")?
                    .unwrap_or(DEFAULT_ORIENTATION_DEVIATION);
                let (constraint, path_metric) =
                    slerp_orientation_constraint(from, to, tolerance);
                opt.constraints
                    .add_constraint(ORIENTATION_CONSTRAINT, constraint);
                opt.path_metric = Some(path_metric);
            }
            MotionProfile::PositionOnly => {
                opt.goal_metric = position_only_metric();
            }
            MotionProfile::Free => {
                if explicit_alg.is_none() {
                    // try RRT* briefly first; if the result is inadequate,
                    // fall back to the capable planner with the full timeout
                    let mut first_try = planning_opts.clone();
                    first_try.insert("timeout".to_owned(), Value::from(DEFAULT_FALLBACK_TIMEOUT));
                    first_try.insert("planning_alg".to_owned(), Value::from("rrtstar"));
                    let mut first_try_opt = self.plan_setup_from_move_request(
                        from,
                        to,
                        seed_map,
                        world,
                        &first_try,
                    )?;
                    first_try_opt.fallback = Some(Box::new(opt));
                    opt = first_try_opt;
                }
            }
        }
        Ok(opt)
    }

    /// Two levels of fallback below an options bundle cover the specified
    /// behavior; deeper nesting is rejected before any planner is built.
    fn ensure_fallback_depth(options: &PlannerOptions) -> Result<(), PlanError> {
        if options.fallback_depth() > 2 {
            return Err(PlanError::InvalidInput(
                "fallback chains may be at most two levels deep".to_owned(),
            ));
        }
        Ok(())
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A fresh random source for a sub-planner: the explicit `rseed` when
    /// the caller provided one, otherwise a draw from the manager's own
    /// random source.
    fn derive_rng(&self, options: &PlannerOptions) -> StdRng {
        match options.rseed() {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(self.rng().gen()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{Limit, SerialChain},
        options::DEFAULT_OPTIMALITY_MULTIPLE,
        spatial::{point_to_segment, pose_delta, Point, Vector},
        world::Geometry,
    };
    use serde_json::json;
    use std::f64::consts::FRAC_PI_4;
    use std::time::Instant;

    fn arm2() -> Arc<dyn Frame> {
        Arc::new(SerialChain::planar("arm", &[1.0, 1.0], Limit::new(-3.1, 3.1)))
    }

    fn arm3() -> Arc<dyn Frame> {
        Arc::new(SerialChain::planar("arm", &[1.0, 1.0, 0.5], Limit::new(-3.1, 3.1)))
    }

    fn seed_map_for(frame: &Arc<dyn Frame>, q: &[f64]) -> SeedMap {
        let mut map = SeedMap::new();
        map.insert(frame.name().to_owned(), q.to_vec());
        map
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("test config is an object")
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn free_profile_reaches_the_goal() {
        init_logging();
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 1);
        let seed_q = [0.0, 0.0];
        let goal_q = [FRAC_PI_4, FRAC_PI_4];
        let goal = frame.transform(&goal_q).unwrap();

        let steps = manager
            .plan_single_waypoint(
                &Context::background(),
                &seed_map_for(&frame, &seed_q),
                goal,
                &WorldState::new(),
                &config(json!({"rseed": 7})),
            )
            .unwrap();

        assert!(steps.len() >= 2);
        assert_eq!(steps[0].as_slice(), &seed_q[..]);
        let reached = frame.transform(steps.last().unwrap()).unwrap();
        let (dt, dr) = pose_delta(&reached, &goal);
        assert!(dt < 1e-4, "translation error {dt}");
        assert!(dr < 1e-4, "rotation error {dr}");
    }

    #[test]
    fn identical_requests_produce_identical_paths() {
        let frame = arm2();
        let goal = frame.transform(&[1.1, -0.6]).unwrap();
        let run = || {
            let manager = PlanManager::new_world_rooted(frame.clone(), 99);
            manager
                .plan_single_waypoint(
                    &Context::background(),
                    &seed_map_for(&frame, &[0.0, 0.0]),
                    goal,
                    &WorldState::new(),
                    &config(json!({"planning_alg": "cbirrt", "rseed": 5})),
                )
                .unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn plans_around_a_blocking_obstacle() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 2);
        let seed_q = [-FRAC_PI_4, 0.0];
        let goal_q = [FRAC_PI_4 + 0.4, 0.3];
        let goal = frame.transform(&goal_q).unwrap();
        let seed_pose = frame.transform(&seed_q).unwrap();

        let mut world = WorldState::new();
        world.add_obstacle(
            "block",
            Geometry::cuboid(
                Pose::translation(1.9, 0.2, 0.0),
                Vector::new(0.15, 0.15, 0.5),
            ),
        );

        let steps = manager
            .plan_single_waypoint(
                &Context::background(),
                &seed_map_for(&frame, &seed_q),
                goal,
                &world,
                &config(json!({"rseed": 11})),
            )
            .unwrap();

        // every configuration clears the obstacle
        let obstacle = crate::constraint::obstacle_constraint(frame.clone(), &world, &seed_q)
            .unwrap();
        for q in &steps {
            let pose = frame.transform(q).unwrap();
            let input = crate::constraint::ConstraintInput {
                start_q: q,
                end_q: q,
                start_pose: &pose,
                end_pose: &pose,
            };
            assert!((*obstacle)(&input), "configuration {q:?} collides");
        }

        // and the path must leave the straight Cartesian line to get around
        let start: Point = seed_pose.translation.vector.into();
        let finish: Point = goal.translation.vector.into();
        let mut max_deviation: f64 = 0.0;
        for q in &steps {
            let pose = frame.transform(q).unwrap();
            let (deviation, _) =
                point_to_segment(&pose.translation.vector.into(), &start, &finish);
            max_deviation = max_deviation.max(deviation);
        }
        assert!(max_deviation > 0.1, "max deviation {max_deviation}");
    }

    #[test]
    fn out_of_reach_goal_fails_without_a_path() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 3);
        let result = manager.plan_single_waypoint(
            &Context::background(),
            &seed_map_for(&frame, &[0.0, 0.0]),
            Pose::translation(5.0, 0.0, 0.0),
            &WorldState::new(),
            &config(json!({"rseed": 13})),
        );
        assert!(matches!(result, Err(PlanError::UnreachableGoal)));
    }

    #[test]
    fn unresolvable_seed_map_is_invalid_input() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 4);
        let mut bad_map = SeedMap::new();
        bad_map.insert("gripper".to_owned(), vec![0.0, 0.0]);
        let result = manager.plan_single_waypoint(
            &Context::background(),
            &bad_map,
            Pose::translation(1.0, 1.0, 0.0),
            &WorldState::new(),
            &Map::new(),
        );
        assert!(matches!(result, Err(PlanError::Frame(_))));
    }

    #[test]
    fn linear_profile_decomposes_and_stays_in_the_tube() {
        let frame = arm3();
        let manager = PlanManager::new_world_rooted(frame.clone(), 5);
        let seed_q = [0.4, 0.4, 0.2];
        let goal_q = [0.2, 0.6, 0.3];
        let goal = frame.transform(&goal_q).unwrap();
        let seed_pose = frame.transform(&seed_q).unwrap();

        let (separation, _) = pose_delta(&seed_pose, &goal);
        // spacing chosen so the move decomposes into four sub-waypoints
        let step_size = separation / 3.5;
        let line_tolerance = 0.1;

        let steps = manager
            .plan_single_waypoint(
                &Context::background(),
                &seed_map_for(&frame, &seed_q),
                goal,
                &WorldState::new(),
                &config(json!({
                    "motion_profile": "linear",
                    "path_step_size": step_size,
                    "line_tolerance": line_tolerance,
                    "orient_tolerance": 0.5,
                    "rseed": 17,
                })),
            )
            .unwrap();

        assert_eq!(steps[0].as_slice(), &seed_q[..]);
        let reached = frame.transform(steps.last().unwrap()).unwrap();
        let (dt, _) = pose_delta(&reached, &goal);
        assert!(dt < 1e-4);

        // every configuration stays inside the tube around the full line,
        // and progress along the line is monotone within tolerance
        let start: Point = seed_pose.translation.vector.into();
        let finish: Point = goal.translation.vector.into();
        let mut last_t: f64 = 0.0;
        for q in &steps {
            let pose = frame.transform(q).unwrap();
            let (deviation, t) =
                point_to_segment(&pose.translation.vector.into(), &start, &finish);
            assert!(
                deviation <= line_tolerance + 1e-6,
                "tube deviation {deviation}"
            );
            assert!(t >= last_t - 0.1, "line parameter regressed: {t} < {last_t}");
            last_t = last_t.max(t);
        }
    }

    #[test]
    fn linear_profile_to_unreachable_goal_fails_fast() {
        let frame = arm3();
        let manager = PlanManager::new_world_rooted(frame.clone(), 6);
        let result = manager.plan_single_waypoint(
            &Context::background(),
            &seed_map_for(&frame, &[0.0, 0.0, 0.0]),
            Pose::translation(6.0, 0.0, 0.0),
            &WorldState::new(),
            &config(json!({
                "motion_profile": "linear",
                "path_step_size": 0.5,
                "rseed": 19,
            })),
        );
        assert!(matches!(result, Err(PlanError::UnreachableGoal)));
    }

    #[test]
    fn fallback_chains_two_deep_pass_and_three_deep_are_rejected() {
        let mut two_deep = PlannerOptions::new_basic();
        let mut first_fallback = PlannerOptions::new_basic();
        first_fallback.fallback = Some(Box::new(PlannerOptions::new_basic()));
        two_deep.fallback = Some(Box::new(first_fallback));
        assert_eq!(two_deep.fallback_depth(), 2);
        assert!(PlanManager::ensure_fallback_depth(&two_deep).is_ok());

        let mut three_deep = PlannerOptions::new_basic();
        three_deep.fallback = Some(Box::new(two_deep));
        assert_eq!(three_deep.fallback_depth(), 3);
        assert!(matches!(
            PlanManager::ensure_fallback_depth(&three_deep),
            Err(PlanError::InvalidInput(_))
        ));
    }

    #[test]
    fn whole_plan_timeout_reads_as_cancellation() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 12);
        let goal = frame.transform(&[0.9, 0.4]).unwrap();
        let result = manager.plan_single_waypoint(
            &Context::background(),
            &seed_map_for(&frame, &[0.0, 0.0]),
            goal,
            &WorldState::new(),
            &config(json!({"timeout": 0.0, "rseed": 43})),
        );
        assert!(matches!(result, Err(PlanError::Cancelled)));
    }

    #[test]
    fn explicit_cbirrt_plans_without_fallback() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 7);
        let goal = frame.transform(&[0.9, 0.4]).unwrap();
        let steps = manager
            .plan_single_waypoint(
                &Context::background(),
                &seed_map_for(&frame, &[0.0, 0.0]),
                goal,
                &WorldState::new(),
                &config(json!({"planning_alg": "cbirrt", "rseed": 23})),
            )
            .unwrap();
        assert!(steps.len() >= 2);
    }

    #[test]
    fn failed_primary_is_rescued_by_fallback() {
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 8);
        let goal_q = [0.8, -0.5];
        let goal = frame.transform(&goal_q).unwrap();
        let seed: Config = [0.0, 0.0].iter().copied().collect();

        // a primary that cannot connect in a single iteration, backed by a
        // normally configured fallback
        let mut primary = PlannerOptions::new_basic();
        primary.constructor = PlannerConstructor::RRTStarConnect;
        primary.plan_iterations = 1;
        let fallback = PlannerOptions::new_basic();
        primary.fallback = Some(Box::new(fallback));

        let planner = PathPlanner::build(
            frame.clone(),
            Arc::new(primary),
            StdRng::seed_from_u64(31),
        );
        let ctx = Context::background();
        let steps = thread::scope(|scope| {
            let (_, promise) = manager
                .plan_single_atomic_waypoint(scope, &ctx, &goal, seed.clone(), &planner, None)
                .unwrap();
            promise.result(&ctx)
        })
        .unwrap();

        assert_eq!(steps[0], seed);
        let reached = frame.transform(steps.last().unwrap()).unwrap();
        let (dt, _) = pose_delta(&reached, &goal);
        assert!(dt < 1e-4);
    }

    #[test]
    fn good_primary_path_is_kept_near_optimal() {
        // in free space the automatic mode must return a path within the
        // optimality multiple, whichever planner produced it
        let frame = arm2();
        let manager = PlanManager::new_world_rooted(frame.clone(), 9);
        let seed_q = [0.0, 0.0];
        let goal_q = [0.7, 0.5];
        let goal = frame.transform(&goal_q).unwrap();

        let steps = manager
            .plan_single_waypoint(
                &Context::background(),
                &seed_map_for(&frame, &seed_q),
                goal,
                &WorldState::new(),
                &config(json!({"rseed": 37})),
            )
            .unwrap();

        let options = PlannerOptions::new_basic();
        let cost = evaluate_plan(&steps, &*options.distance_func);
        let straight: Config = goal_q.iter().copied().collect();
        let optimal = (*options.distance_func)(&steps[0], &straight);
        assert!(
            cost < optimal * DEFAULT_OPTIMALITY_MULTIPLE + 1e-9,
            "cost {cost} optimal {optimal}"
        );
    }

    #[test]
    fn cancellation_stops_planning_promptly() {
        init_logging();
        let frame = arm2();
        let manager = Arc::new(PlanManager::new_world_rooted(frame.clone(), 10));
        // radial walls block every sweep of the base joint between seed
        // and goal, so sampling runs until stopped
        let mut world = WorldState::new();
        for (name, angle) in [("wall_ccw", 1.0f64), ("wall_cw", -2.0f64)] {
            for step in 0..8 {
                let r = 0.3 + 0.25 * step as f64;
                world.add_obstacle(
                    format!("{name}_{step}"),
                    Geometry::sphere(
                        Point::new(r * angle.cos(), r * angle.sin(), 0.0),
                        0.12,
                    ),
                );
            }
        }
        let goal = frame.transform(&[2.5, 0.1]).unwrap();

        let ctx = Context::background();
        let canceller = ctx.clone();
        let start = Instant::now();
        let handle = {
            let manager = Arc::clone(&manager);
            let frame = frame.clone();
            let ctx = ctx.clone();
            thread::spawn(move || {
                manager.plan_single_waypoint(
                    &ctx,
                    &seed_map_for(&frame, &[0.0, 0.0]),
                    goal,
                    &world,
                    &config(json!({
                        "planning_alg": "cbirrt",
                        "timeout": 60.0,
                        "plan_iter": 2_000_000,
                        "rseed": 41,
                    })),
                )
            })
        };
        thread::sleep(Duration::from_millis(150));
        canceller.cancel();
        let result = handle.join().unwrap();

        assert!(matches!(result, Err(PlanError::Cancelled)));
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "cancellation took {:?}",
            start.elapsed()
        );
    }
}
