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
    collision::CollisionGraph,
    error::FrameError,
    frame::{interpolate_config, Frame},
    spatial::{interpolate, point_to_segment, pose_delta, Point, Pose},
    world::{Geometry, WorldState},
};
use std::sync::Arc;

pub const SELF_COLLISION_CONSTRAINT: &str = "self_collision";
pub const OBSTACLE_CONSTRAINT: &str = "obstacle";
pub const LINEAR_CONSTRAINT: &str = "linear_interpolation";
pub const PSEUDOLINEAR_CONSTRAINT: &str = "pseudolinear_interpolation";
pub const ORIENTATION_CONSTRAINT: &str = "orientation_slerp";

/// Distance between two joint configurations. Must be non-negative.
pub type DistanceFn = dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync;
pub type DistanceFunc = Arc<DistanceFn>;

/// Distance between two poses, used to score IK solutions and path
/// following. Must be non-negative.
pub type StateMetricFn = dyn Fn(&Pose, &Pose) -> f64 + Send + Sync;
pub type StateMetric = Arc<StateMetricFn>;

/// A configuration, or a pair of configurations bounding a path segment,
/// with the corresponding end-effector poses. For a point check the start
/// and end sides are identical.
pub struct ConstraintInput<'a> {
    pub start_q: &'a [f64],
    pub end_q: &'a [f64],
    pub start_pose: &'a Pose,
    pub end_pose: &'a Pose,
}

/// A named predicate over a [`ConstraintInput`]. Must be side-effect free:
/// the evaluator may invoke it concurrently on independent configurations.
pub type Constraint = Arc<dyn Fn(&ConstraintInput) -> bool + Send + Sync>;

/// Euclidean distance over joint configurations. Additive along straight
/// configuration-space lines, which path cost accumulation relies on.
pub fn l2_config_metric() -> DistanceFunc {
    Arc::new(|a, b| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    })
}

/// Squared pose separation: translation distance squared plus rotation
/// angle squared.
pub fn square_pose_metric() -> StateMetric {
    Arc::new(|a, b| {
        let (translation, rotation) = pose_delta(a, b);
        translation * translation + rotation * rotation
    })
}

/// Pose metric that ignores orientation error entirely.
pub fn position_only_metric() -> StateMetric {
    Arc::new(|a, b| {
        let (translation, _) = pose_delta(a, b);
        translation * translation
    })
}

/// An ordered, named collection of constraints. After planner setup the two
/// collision constraints are always present; motion profiles add more.
#[derive(Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<(String, Constraint)>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constraint(&mut self, name: impl Into<String>, constraint: Constraint) {
        self.constraints.push((name.into(), constraint));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Whether every constraint accepts the given input.
    pub fn valid(&self, input: &ConstraintInput) -> bool {
        self.constraints
            .iter()
            .all(|(_, constraint)| (**constraint)(input))
    }

    /// Point check of a single configuration.
    pub fn check_state(&self, frame: &dyn Frame, q: &[f64]) -> Result<bool, FrameError> {
        let pose = frame.transform(q)?;
        Ok(self.valid(&ConstraintInput {
            start_q: q,
            end_q: q,
            start_pose: &pose,
            end_pose: &pose,
        }))
    }

    /// Segment check: interpolate between two configurations at the given
    /// joint-space resolution and require every constraint on every
    /// interpolated pair.
    pub fn check_segment(
        &self,
        frame: &dyn Frame,
        from: &[f64],
        to: &[f64],
        resolution: f64,
    ) -> Result<bool, FrameError> {
        let length: f64 = from
            .iter()
            .zip(to.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        let steps = ((length / resolution).ceil() as usize).max(1);

        let mut previous_q = interpolate_config(from, to, 0.0);
        let mut previous_pose = frame.transform(&previous_q)?;
        for step in 1..=steps {
            let by = step as f64 / steps as f64;
            let next_q = interpolate_config(from, to, by);
            let next_pose = frame.transform(&next_q)?;
            let input = ConstraintInput {
                start_q: &previous_q,
                end_q: &next_q,
                start_pose: &previous_pose,
                end_pose: &next_pose,
            };
            if !self.valid(&input) {
                return Ok(false);
            }
            previous_q = next_q;
            previous_pose = next_pose;
        }
        Ok(true)
    }
}

/// Pairwise distance among the mechanism's own geometries. Contact already
/// present at the seed configuration is recorded in a reference graph and
/// ignored thereafter.
pub fn self_collision_constraint(
    frame: Arc<dyn Frame>,
    seed: &[f64],
) -> Result<Constraint, FrameError> {
    let reference = CollisionGraph::build(&frame.geometries(seed)?, None, None, true);
    Ok(Arc::new(move |input: &ConstraintInput| {
        let Ok(geometries) = frame.geometries(input.end_q) else {
            return false;
        };
        CollisionGraph::build(&geometries, None, Some(&reference), false)
            .collisions()
            .is_empty()
    }))
}

/// Pairwise distance between mechanism geometries and world obstacles.
pub fn obstacle_constraint(
    frame: Arc<dyn Frame>,
    world: &WorldState,
    seed: &[f64],
) -> Result<Constraint, FrameError> {
    let obstacles: Vec<(String, Geometry)> = world
        .obstacles()
        .map(|(name, geometry)| (name.clone(), geometry.clone()))
        .collect();
    let reference = CollisionGraph::build(
        &frame.geometries(seed)?,
        Some(&obstacles),
        None,
        true,
    );
    Ok(Arc::new(move |input: &ConstraintInput| {
        let Ok(geometries) = frame.geometries(input.end_q) else {
            return false;
        };
        CollisionGraph::build(&geometries, Some(&obstacles), Some(&reference), false)
            .collisions()
            .is_empty()
    }))
}

fn tube_deviation(pose: &Pose, from: &Pose, to: &Pose) -> (f64, f64, f64) {
    let position: Point = pose.translation.vector.into();
    let start: Point = from.translation.vector.into();
    let finish: Point = to.translation.vector.into();
    let (line_deviation, t) = point_to_segment(&position, &start, &finish);
    let expected = interpolate(from, to, t);
    let orientation_deviation = expected.rotation.angle_to(&pose.rotation);
    (line_deviation, orientation_deviation, t)
}

/// The segment's poses must lie within a fixed-radius tube around the
/// straight line from `from` to `to`, with orientation following the SLERP
/// path between the endpoint orientations. Returns the constraint and the
/// path metric that scores deviation from that line.
pub fn absolute_linear_constraint(
    from: &Pose,
    to: &Pose,
    line_tolerance: f64,
    orient_tolerance: f64,
) -> (Constraint, StateMetric) {
    let (from, to) = (*from, *to);
    let constraint: Constraint = Arc::new(move |input: &ConstraintInput| {
        for pose in [input.start_pose, input.end_pose] {
            let (line, orientation, _) = tube_deviation(pose, &from, &to);
            if line > line_tolerance || orientation > orient_tolerance {
                return false;
            }
        }
        true
    });
    let metric: StateMetric = Arc::new(move |pose: &Pose, _goal: &Pose| {
        let (line, orientation, _) = tube_deviation(pose, &from, &to);
        line * line + orientation * orientation
    });
    (constraint, metric)
}

/// Like [`absolute_linear_constraint`], but the tube radius is proportional
/// to the segment length and the orientation tolerance proportional to the
/// rotation spanned by the segment.
pub fn proportional_linear_constraint(
    from: &Pose,
    to: &Pose,
    tolerance: f64,
) -> (Constraint, StateMetric) {
    let (translation, rotation) = pose_delta(from, to);
    let line_tolerance = translation * tolerance;
    let orient_tolerance = (rotation * tolerance).max(1e-4);
    absolute_linear_constraint(from, to, line_tolerance, orient_tolerance)
}

/// Orientation along the segment must follow the great-circle quaternion
/// path between the endpoint orientations within `tolerance`; position is
/// unconstrained.
pub fn slerp_orientation_constraint(
    from: &Pose,
    to: &Pose,
    tolerance: f64,
) -> (Constraint, StateMetric) {
    let (from, to) = (*from, *to);
    let constraint: Constraint = Arc::new(move |input: &ConstraintInput| {
        for pose in [input.start_pose, input.end_pose] {
            let (_, orientation, _) = tube_deviation(pose, &from, &to);
            if orientation > tolerance {
                return false;
            }
        }
        true
    });
    let metric: StateMetric = Arc::new(move |pose: &Pose, _goal: &Pose| {
        let (_, orientation, _) = tube_deviation(pose, &from, &to);
        orientation * orientation
    });
    (constraint, metric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{Limit, SerialChain},
        spatial::Vector,
    };
    use std::f64::consts::FRAC_PI_2;

    fn arm() -> Arc<dyn Frame> {
        Arc::new(SerialChain::planar("arm", &[1.0, 1.0], Limit::new(-3.1, 3.1)))
    }

    #[test]
    fn self_collision_accepts_stretched_arm() {
        let frame = arm();
        let constraint = self_collision_constraint(frame.clone(), &[0.0, 0.0]).unwrap();
        let mut set = ConstraintSet::new();
        set.add_constraint(SELF_COLLISION_CONSTRAINT, constraint);
        assert!(set.check_state(frame.as_ref(), &[0.0, 0.5]).unwrap());
    }

    #[test]
    fn obstacle_constraint_rejects_configs_inside_obstacles() {
        let frame = arm();
        let mut world = WorldState::new();
        world.add_obstacle(
            "pillar",
            Geometry::cuboid(Pose::translation(0.0, 1.5, 0.0), Vector::new(0.4, 0.4, 0.4)),
        );
        let constraint = obstacle_constraint(frame.clone(), &world, &[0.0, 0.0]).unwrap();
        let mut set = ConstraintSet::new();
        set.add_constraint(OBSTACLE_CONSTRAINT, constraint);

        // stretched along +x stays clear; folded straight up hits the pillar
        assert!(set.check_state(frame.as_ref(), &[0.0, 0.0]).unwrap());
        assert!(!set.check_state(frame.as_ref(), &[FRAC_PI_2, 0.0]).unwrap());
    }

    #[test]
    fn segment_check_interpolates_through_violations() {
        let frame = arm();
        let mut world = WorldState::new();
        world.add_obstacle(
            "pillar",
            Geometry::cuboid(Pose::translation(0.0, 1.5, 0.0), Vector::new(0.4, 0.4, 0.4)),
        );
        let constraint = obstacle_constraint(frame.clone(), &world, &[0.0, 0.0]).unwrap();
        let mut set = ConstraintSet::new();
        set.add_constraint(OBSTACLE_CONSTRAINT, constraint);

        // both endpoints are clear of the pillar but the swept arc is not
        let valid = set
            .check_segment(frame.as_ref(), &[0.2, 0.0], &[2.9, 0.0], 0.05)
            .unwrap();
        assert!(!valid);
    }

    #[test]
    fn linear_tube_constraint_measures_deviation() {
        let from = Pose::translation(0.0, 0.0, 0.0);
        let to = Pose::translation(1.0, 0.0, 0.0);
        let (constraint, metric) = absolute_linear_constraint(&from, &to, 0.1, 0.1);

        let on_line = Pose::translation(0.5, 0.05, 0.0);
        let off_line = Pose::translation(0.5, 0.5, 0.0);
        let q = [0.0];
        let input_ok = ConstraintInput {
            start_q: &q,
            end_q: &q,
            start_pose: &on_line,
            end_pose: &on_line,
        };
        let input_bad = ConstraintInput {
            start_q: &q,
            end_q: &q,
            start_pose: &off_line,
            end_pose: &off_line,
        };
        assert!(constraint(&input_ok));
        assert!(!constraint(&input_bad));
        assert!((*metric)(&off_line, &to) > (*metric)(&on_line, &to));
    }

    #[test]
    fn proportional_tube_scales_with_segment_length() {
        let from = Pose::translation(0.0, 0.0, 0.0);
        let near = Pose::translation(0.1, 0.0, 0.0);
        let far = Pose::translation(10.0, 0.0, 0.0);
        let probe = Pose::translation(0.05, 0.05, 0.0);
        let q = [0.0];

        let (tight, _) = proportional_linear_constraint(&from, &near, 0.1);
        let (loose, _) = proportional_linear_constraint(&from, &far, 0.1);
        let input = ConstraintInput {
            start_q: &q,
            end_q: &q,
            start_pose: &probe,
            end_pose: &probe,
        };
        assert!(!tight(&input));
        assert!(loose(&input));
    }

    #[test]
    fn position_only_metric_ignores_orientation() {
        let metric = position_only_metric();
        let a = Pose::identity();
        let b = Pose::rotation(Vector::new(0.0, 0.0, 1.0));
        assert_eq!((*metric)(&a, &b), 0.0);
    }
}
