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
    constraint::{l2_config_metric, square_pose_metric, ConstraintSet, DistanceFunc, StateMetric},
    error::PlanError,
};
use serde_json::{Map, Value};

/// Documented defaults. A numeric key absent from the motion configuration
/// falls back to the value here.
pub const DEFAULT_TIMEOUT: f64 = 10.0;
pub const DEFAULT_FALLBACK_TIMEOUT: f64 = 1.5;
pub const DEFAULT_OPTIMALITY_MULTIPLE: f64 = 2.0;
pub const DEFAULT_PATH_STEP_SIZE: f64 = 0.1;
pub const DEFAULT_LINEAR_DEVIATION: f64 = 0.01;
pub const DEFAULT_PSEUDOLINEAR_TOLERANCE: f64 = 0.8;
pub const DEFAULT_ORIENTATION_DEVIATION: f64 = 0.05;
pub const DEFAULT_RESOLUTION: f64 = 0.05;
pub const DEFAULT_PLAN_ITERATIONS: usize = 2000;
pub const DEFAULT_FRAME_STEP_FRACTION: f64 = 0.015;
pub const DEFAULT_INPUT_IDENT_DISTANCE: f64 = 1e-4;
pub const DEFAULT_MAX_IK_SOLUTIONS: usize = 10;
pub const DEFAULT_GOAL_BIAS: f64 = 0.1;
pub const DEFAULT_SMOOTH_ITERATIONS: usize = 100;
pub const DEFAULT_SMOOTH_SWAP_PROBABILITY: f64 = 0.5;
pub const DEFAULT_SMOOTH_WINDOW: usize = 10;

/// Kinematic shape the end effector must follow between waypoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionProfile {
    Linear,
    Pseudolinear,
    Orientation,
    PositionOnly,
    #[default]
    Free,
}

impl MotionProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionProfile::Linear => "linear",
            MotionProfile::Pseudolinear => "pseudolinear",
            MotionProfile::Orientation => "orientation",
            MotionProfile::PositionOnly => "position_only",
            MotionProfile::Free => "free",
        }
    }

    /// Parse the `motion_profile` key. A missing key means free motion.
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, PlanError> {
        let Some(value) = config.get("motion_profile") else {
            return Ok(MotionProfile::Free);
        };
        let Some(name) = value.as_str() else {
            return Err(PlanError::InvalidInput(
                "could not interpret motion_profile field as string".to_owned(),
            ));
        };
        match name {
            "linear" => Ok(MotionProfile::Linear),
            "pseudolinear" => Ok(MotionProfile::Pseudolinear),
            "orientation" => Ok(MotionProfile::Orientation),
            "position_only" => Ok(MotionProfile::PositionOnly),
            "free" => Ok(MotionProfile::Free),
            other => Err(PlanError::InvalidInput(format!(
                "unknown motion_profile [{other}]"
            ))),
        }
    }
}

/// Which sampling planner to construct for an atomic waypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlannerConstructor {
    /// Constrained bidirectional RRT-Connect; the default capable planner.
    #[default]
    CBiRRT,
    /// Asymptotically optimal bidirectional planner; the fast first try.
    RRTStarConnect,
    /// Unidirectional RRT without the parallel capability set.
    BasicRRT,
}

/// Parse the `planning_alg` key; None when absent. An unrecognized name is
/// rejected before any planner runs.
pub fn planning_alg_from_config(
    config: &Map<String, Value>,
) -> Result<Option<PlannerConstructor>, PlanError> {
    let Some(value) = config.get("planning_alg") else {
        return Ok(None);
    };
    let Some(name) = value.as_str() else {
        return Err(PlanError::InvalidInput(
            "could not interpret planning_alg field as string".to_owned(),
        ));
    };
    match name {
        "cbirrt" => Ok(Some(PlannerConstructor::CBiRRT)),
        "rrtstar" => Ok(Some(PlannerConstructor::RRTStarConnect)),
        other => Err(PlanError::InvalidInput(format!(
            "unknown planning_alg [{other}]"
        ))),
    }
}

/// Read a numeric key from an untyped configuration map. Missing keys
/// return None; present keys must be numbers.
pub fn f64_from_config(
    config: &Map<String, Value>,
    key: &str,
) -> Result<Option<f64>, PlanError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => value.as_f64().map(Some).ok_or_else(|| {
            PlanError::InvalidInput(format!("could not interpret {key} field as number"))
        }),
    }
}

pub fn usize_from_config(
    config: &Map<String, Value>,
    key: &str,
) -> Result<Option<usize>, PlanError> {
    match config.get(key) {
        None => Ok(None),
        Some(value) => value.as_u64().map(|v| Some(v as usize)).ok_or_else(|| {
            PlanError::InvalidInput(format!("could not interpret {key} field as integer"))
        }),
    }
}

/// The immutable option bundle handed to one planner instance.
#[derive(Clone)]
pub struct PlannerOptions {
    pub constraints: ConstraintSet,

    /// Distance between joint configurations; scores paths and nearest
    /// neighbor queries.
    pub distance_func: DistanceFunc,

    /// Pose metric used to accept and rank IK solutions for the goal.
    pub goal_metric: StateMetric,

    /// Metric scoring deviation from the profile path, when a profile
    /// installed one.
    pub path_metric: Option<StateMetric>,

    /// Hard deadline for this planner, seconds.
    pub timeout: f64,

    /// Joint-space resolution for segment constraint checks.
    pub resolution: f64,

    pub plan_iterations: usize,

    /// Per-joint extension step, as a fraction of each joint's range.
    pub frame_step_fraction: f64,

    /// Configurations closer than this (under `distance_func`) are the same.
    pub input_ident_distance: f64,

    pub max_ik_solutions: usize,

    /// Probability that tree extension samples toward the opposite root.
    pub goal_bias: f64,

    pub smooth_iterations: usize,
    pub smooth_swap_probability: f64,
    pub smooth_window: usize,

    pub constructor: PlannerConstructor,

    /// Options for the planner to try if this one's result is not good
    /// enough. At most one level of nesting below this one.
    pub fallback: Option<Box<PlannerOptions>>,

    /// Untyped pass-through of the caller's motion configuration. Carries
    /// `rseed` and any keys this crate does not recognize.
    pub extras: Map<String, Value>,
}

impl PlannerOptions {
    /// Options with every field at its documented default and no
    /// constraints beyond what the caller adds later.
    pub fn new_basic() -> Self {
        Self {
            constraints: ConstraintSet::new(),
            distance_func: l2_config_metric(),
            goal_metric: square_pose_metric(),
            path_metric: None,
            timeout: DEFAULT_TIMEOUT,
            resolution: DEFAULT_RESOLUTION,
            plan_iterations: DEFAULT_PLAN_ITERATIONS,
            frame_step_fraction: DEFAULT_FRAME_STEP_FRACTION,
            input_ident_distance: DEFAULT_INPUT_IDENT_DISTANCE,
            max_ik_solutions: DEFAULT_MAX_IK_SOLUTIONS,
            goal_bias: DEFAULT_GOAL_BIAS,
            smooth_iterations: DEFAULT_SMOOTH_ITERATIONS,
            smooth_swap_probability: DEFAULT_SMOOTH_SWAP_PROBABILITY,
            smooth_window: DEFAULT_SMOOTH_WINDOW,
            constructor: PlannerConstructor::default(),
            fallback: None,
            extras: Map::new(),
        }
    }

    /// Overwrite numeric fields present in the caller's configuration,
    /// leaving defaults elsewhere. Key by key, no reflection.
    pub fn apply_config(&mut self, config: &Map<String, Value>) -> Result<(), PlanError> {
        if let Some(timeout) = f64_from_config(config, "timeout")? {
            self.timeout = timeout;
        }
        if let Some(resolution) = f64_from_config(config, "resolution")? {
            self.resolution = resolution;
        }
        if let Some(iterations) = usize_from_config(config, "plan_iter")? {
            self.plan_iterations = iterations;
        }
        if let Some(solutions) = usize_from_config(config, "max_ik_solutions")? {
            self.max_ik_solutions = solutions;
        }
        if let Some(iterations) = usize_from_config(config, "smooth_iter")? {
            self.smooth_iterations = iterations;
        }
        self.extras = config.clone();
        Ok(())
    }

    /// The explicit random seed for this planner, when the caller provided
    /// one.
    pub fn rseed(&self) -> Option<u64> {
        self.extras.get("rseed").and_then(Value::as_u64)
    }

    /// Depth of the fallback chain below this options bundle.
    pub fn fallback_depth(&self) -> usize {
        match &self.fallback {
            Some(inner) => 1 + inner.fallback_depth(),
            None => 0,
        }
    }
}
