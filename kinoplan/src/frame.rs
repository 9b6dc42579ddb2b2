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
    constraint::StateMetric,
    context::Context,
    error::{FrameError, PlanError},
    spatial::{Point, Pose, Vector},
    world::Geometry,
};
use nalgebra::{DMatrix, DVector, Unit, UnitQuaternion};
use rand::{rngs::StdRng, Rng};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// An ordered vector of scalar joint inputs. Length equals the degree of
/// freedom count of the frame it belongs to.
pub type Config = SmallVec<[f64; 8]>;

/// Mapping from frame name to that frame's joint inputs, as provided by the
/// caller of a plan request.
pub type SeedMap = BTreeMap<String, Vec<f64>>;

/// Name of the root frame of every frame system.
pub const WORLD_FRAME: &str = "world";

/// Metric values below this are treated as an exact inverse kinematics hit.
const IK_SOLVED_EPSILON: f64 = 1e-11;

/// Distinct IK solutions must differ by at least this much in joint space.
const IK_DISTINCT_DISTANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limit {
    pub min: f64,
    pub max: f64,
}

impl Limit {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Componentwise linear interpolation between two configurations.
pub fn interpolate_config(from: &[f64], to: &[f64], by: f64) -> Config {
    from.iter()
        .zip(to.iter())
        .map(|(f, t)| f + (t - f) * by)
        .collect()
}

/// The solver frame: the chain (or composite of chains) being planned for.
/// Pure kinematic queries only; implementations must be side-effect free so
/// the evaluator may call them concurrently on independent configurations.
pub trait Frame: Send + Sync {
    fn name(&self) -> &str;

    fn dof(&self) -> usize;

    fn limits(&self) -> &[Limit];

    /// Forward kinematics: the pose of the end of the frame at `q`.
    fn transform(&self, q: &[f64]) -> Result<Pose, FrameError>;

    /// The mechanism's own collision geometries at `q`, named uniquely.
    fn geometries(&self, q: &[f64]) -> Result<Vec<(String, Geometry)>, FrameError>;

    /// Resolve a caller-provided seed map to this frame's input vector.
    fn map_to_slice(&self, seed_map: &SeedMap) -> Result<Config, FrameError>;

    /// Inverse kinematics: up to `max_solutions` joint configurations whose
    /// forward kinematics minimize `metric` against `goal`, ordered by
    /// configuration-space distance from `seed`. An empty result means the
    /// goal is out of reach.
    fn solve_ik(
        &self,
        ctx: &Context,
        goal: &Pose,
        seed: &[f64],
        metric: &StateMetric,
        rng: &mut StdRng,
        max_solutions: usize,
    ) -> Result<Vec<Config>, PlanError>;

    /// Whether goals arrive expressed in a frame other than the world root
    /// and must be translated by the frame system before planning.
    fn world_rooted(&self) -> bool {
        false
    }

    /// The frame in which goals are expressed when world-rooted.
    fn goal_frame(&self) -> &str {
        WORLD_FRAME
    }

    fn ensure_dof(&self, q: &[f64]) -> Result<(), FrameError> {
        if q.len() != self.dof() {
            return Err(FrameError::InputMismatch {
                frame: self.name().to_owned(),
                expected: self.dof(),
                received: q.len(),
            });
        }
        Ok(())
    }
}

/// A pose tagged with the frame it is expressed in.
#[derive(Debug, Clone)]
pub struct PoseInFrame {
    pub parent: String,
    pub pose: Pose,
}

impl PoseInFrame {
    pub fn new(parent: impl Into<String>, pose: Pose) -> Self {
        Self {
            parent: parent.into(),
            pose,
        }
    }
}

/// The part of the frame system the plan manager consumes: re-expressing a
/// pose from one frame into another, given the current joint state.
pub trait FrameSystem: Send + Sync {
    fn transform_pose(
        &self,
        reference: &SeedMap,
        pose: &PoseInFrame,
        target: &str,
    ) -> Result<PoseInFrame, FrameError>;
}

/// A frame system whose frames are all statically posed in the world. Joint
/// state is accepted for interface parity but does not affect the result.
#[derive(Debug, Clone, Default)]
pub struct StaticFrameSystem {
    frames: BTreeMap<String, Pose>,
}

impl StaticFrameSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_frame(&mut self, name: impl Into<String>, pose_in_world: Pose) {
        self.frames.insert(name.into(), pose_in_world);
    }

    fn pose_of(&self, name: &str) -> Result<Pose, FrameError> {
        if name == WORLD_FRAME {
            return Ok(Pose::identity());
        }
        self.frames
            .get(name)
            .copied()
            .ok_or_else(|| FrameError::UnknownFrame(name.to_owned()))
    }
}

impl FrameSystem for StaticFrameSystem {
    fn transform_pose(
        &self,
        _reference: &SeedMap,
        pose: &PoseInFrame,
        target: &str,
    ) -> Result<PoseInFrame, FrameError> {
        let in_world = self.pose_of(&pose.parent)? * pose.pose;
        let target_inverse = self.pose_of(target)?.inverse();
        Ok(PoseInFrame::new(target, target_inverse * in_world))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JointKind {
    Revolute,
    Prismatic,
}

/// One joint of a serial chain: a fixed transform from the previous joint
/// frame, then a motion about or along `axis`.
#[derive(Debug, Clone)]
pub struct Joint {
    pub origin: Pose,
    pub axis: Unit<Vector>,
    pub kind: JointKind,
    pub limit: Limit,
}

/// A serial chain of revolute/prismatic joints with sample-sphere collision
/// geometry along each link.
#[derive(Debug, Clone)]
pub struct SerialChain {
    name: String,
    joints: Vec<Joint>,
    end_effector: Pose,
    limits: Vec<Limit>,
    link_radius: f64,
    world_rooted: bool,
    goal_frame: String,
}

impl SerialChain {
    pub fn new(name: impl Into<String>, joints: Vec<Joint>, end_effector: Pose) -> Self {
        let limits = joints.iter().map(|j| j.limit).collect();
        Self {
            name: name.into(),
            joints,
            end_effector,
            limits,
            link_radius: 0.1,
            world_rooted: false,
            goal_frame: WORLD_FRAME.to_owned(),
        }
    }

    /// A planar arm in the XY plane: revolute joints about Z, links of the
    /// given lengths along X. The workhorse of the in-crate tests.
    pub fn planar(name: impl Into<String>, link_lengths: &[f64], limit: Limit) -> Self {
        let axis = Unit::new_normalize(Vector::z());
        let mut joints = Vec::with_capacity(link_lengths.len());
        let mut previous = 0.0;
        for length in link_lengths {
            joints.push(Joint {
                origin: Pose::translation(previous, 0.0, 0.0),
                axis,
                kind: JointKind::Revolute,
                limit,
            });
            previous = *length;
        }
        Self::new(name, joints, Pose::translation(previous, 0.0, 0.0))
    }

    pub fn with_link_radius(mut self, radius: f64) -> Self {
        self.link_radius = radius;
        self
    }

    pub fn with_goal_frame(mut self, goal_frame: impl Into<String>) -> Self {
        self.world_rooted = true;
        self.goal_frame = goal_frame.into();
        self
    }

    /// Pose of every joint origin plus the end effector, root to tip.
    fn waypoints(&self, q: &[f64]) -> Result<Vec<Pose>, FrameError> {
        self.ensure_dof(q)?;
        let mut poses = Vec::with_capacity(self.joints.len() + 1);
        let mut pose = Pose::identity();
        for (joint, input) in self.joints.iter().zip(q.iter()) {
            pose *= joint.origin;
            poses.push(pose);
            let motion = match joint.kind {
                JointKind::Revolute => Pose::from_parts(
                    nalgebra::Translation3::identity(),
                    UnitQuaternion::from_axis_angle(&joint.axis, *input),
                ),
                JointKind::Prismatic => Pose::from_parts(
                    nalgebra::Translation3::from(joint.axis.into_inner() * *input),
                    UnitQuaternion::identity(),
                ),
            };
            pose *= motion;
        }
        pose *= self.end_effector;
        poses.push(pose);
        Ok(poses)
    }

    /// One damped-least-squares descent from `start`. Returns the converged
    /// configuration if the metric reaches the solved threshold.
    fn descend(
        &self,
        goal: &Pose,
        start: &[f64],
        metric: &StateMetric,
    ) -> Result<Option<Config>, FrameError> {
        const MAX_ITERATIONS: usize = 150;
        const STEP: f64 = 1e-6;
        const DAMPING: f64 = 0.05;

        let metric = &**metric;
        let n = self.dof();
        let mut q: Config = start.iter().copied().collect();
        for _ in 0..MAX_ITERATIONS {
            let pose = self.transform(&q)?;
            if metric(&pose, goal) < IK_SOLVED_EPSILON {
                return Ok(Some(q));
            }

            let error = pose_error(&pose, goal);
            let mut jacobian = DMatrix::<f64>::zeros(6, n);
            for column in 0..n {
                let mut perturbed = q.clone();
                perturbed[column] += STEP;
                let nudged = self.transform(&perturbed)?;
                let delta = pose_error(&pose, &nudged);
                for row in 0..6 {
                    jacobian[(row, column)] = delta[row] / STEP;
                }
            }

            // dq = J^T (J J^T + lambda^2 I)^-1 e
            let jjt = &jacobian * jacobian.transpose()
                + DMatrix::<f64>::identity(6, 6) * DAMPING * DAMPING;
            let correction = match jjt.lu().solve(&error) {
                Some(solved) => jacobian.transpose() * solved,
                None => return Ok(None),
            };
            for (joint, (value, limit)) in
                q.iter_mut().zip(self.limits.iter()).enumerate()
            {
                *value = limit.clamp(*value + correction[joint]);
            }
        }

        let pose = self.transform(&q)?;
        if metric(&pose, goal) < IK_SOLVED_EPSILON {
            return Ok(Some(q));
        }
        Ok(None)
    }
}

/// Pose error as a 6-vector: translation delta stacked on the scaled
/// rotation axis taking `from` to `to`.
fn pose_error(from: &Pose, to: &Pose) -> DVector<f64> {
    let translation = to.translation.vector - from.translation.vector;
    let rotation = (to.rotation * from.rotation.inverse()).scaled_axis();
    DVector::from_column_slice(&[
        translation.x,
        translation.y,
        translation.z,
        rotation.x,
        rotation.y,
        rotation.z,
    ])
}

impl Frame for SerialChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn dof(&self) -> usize {
        self.joints.len()
    }

    fn limits(&self) -> &[Limit] {
        &self.limits
    }

    fn transform(&self, q: &[f64]) -> Result<Pose, FrameError> {
        Ok(*self.waypoints(q)?.last().expect("chain has an end effector"))
    }

    fn geometries(&self, q: &[f64]) -> Result<Vec<(String, Geometry)>, FrameError> {
        let waypoints = self.waypoints(q)?;
        let mut geometries = Vec::new();
        for (link, pair) in waypoints.windows(2).enumerate() {
            let start: Point = pair[0].translation.vector.into();
            let finish: Point = pair[1].translation.vector.into();
            let length = (finish - start).norm();
            let samples = ((length / self.link_radius).ceil() as usize).max(1);
            for sample in 0..=samples {
                let by = sample as f64 / samples as f64;
                let center = start + (finish - start) * by;
                geometries.push((
                    format!("{}:link{}:{}", self.name, link, sample),
                    Geometry::sphere(center, self.link_radius),
                ));
            }
        }
        Ok(geometries)
    }

    fn map_to_slice(&self, seed_map: &SeedMap) -> Result<Config, FrameError> {
        let inputs = seed_map
            .get(&self.name)
            .ok_or_else(|| FrameError::UnknownFrame(self.name.clone()))?;
        self.ensure_dof(inputs)?;
        Ok(inputs.iter().copied().collect())
    }

    fn solve_ik(
        &self,
        ctx: &Context,
        goal: &Pose,
        seed: &[f64],
        metric: &StateMetric,
        rng: &mut StdRng,
        max_solutions: usize,
    ) -> Result<Vec<Config>, PlanError> {
        const RESTARTS: usize = 50;

        self.ensure_dof(seed)?;
        let mut solutions: Vec<Config> = Vec::new();
        for attempt in 0..RESTARTS {
            ctx.check()?;
            if solutions.len() >= max_solutions {
                break;
            }
            let start: Config = if attempt == 0 {
                seed.iter().copied().collect()
            } else {
                self.limits
                    .iter()
                    .map(|limit| rng.gen_range(limit.min..=limit.max))
                    .collect()
            };
            if let Some(solved) = self.descend(goal, &start, metric)? {
                let distinct = solutions.iter().all(|existing| {
                    existing
                        .iter()
                        .zip(solved.iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                        .sqrt()
                        > IK_DISTINCT_DISTANCE
                });
                if distinct {
                    solutions.push(solved);
                }
            }
        }

        // best-first by configuration distance from the seed
        solutions.sort_by(|a, b| {
            let da: f64 = a.iter().zip(seed).map(|(x, s)| (x - s) * (x - s)).sum();
            let db: f64 = b.iter().zip(seed).map(|(x, s)| (x - s) * (x - s)).sum();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(solutions)
    }

    fn world_rooted(&self) -> bool {
        self.world_rooted
    }

    fn goal_frame(&self) -> &str {
        &self.goal_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::square_pose_metric;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    fn planar_arm() -> SerialChain {
        SerialChain::planar("arm", &[1.0, 1.0], Limit::new(-3.1, 3.1))
    }

    #[test]
    fn planar_forward_kinematics() {
        let arm = planar_arm();
        let stretched = arm.transform(&[0.0, 0.0]).unwrap();
        assert_relative_eq!(stretched.translation.x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(stretched.translation.y, 0.0, epsilon = 1e-12);

        let folded = arm.transform(&[FRAC_PI_2, 0.0]).unwrap();
        assert_relative_eq!(folded.translation.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(folded.translation.y, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn dof_mismatch_is_reported() {
        let arm = planar_arm();
        assert!(matches!(
            arm.transform(&[0.0]),
            Err(FrameError::InputMismatch { .. })
        ));
    }

    #[test]
    fn geometries_trace_the_links() {
        let arm = planar_arm();
        let geometries = arm.geometries(&[0.0, 0.0]).unwrap();
        assert!(geometries.len() >= 4);
        for (_, geometry) in &geometries {
            let Geometry::Sphere { center, .. } = geometry else {
                panic!("chain geometry should be sample spheres");
            };
            assert!(center.x >= -1e-9 && center.x <= 2.0 + 1e-9);
            assert_relative_eq!(center.y, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn map_to_slice_requires_the_frame_name() {
        let arm = planar_arm();
        let mut seed_map = SeedMap::new();
        seed_map.insert("other".to_owned(), vec![0.0, 0.0]);
        assert!(matches!(
            arm.map_to_slice(&seed_map),
            Err(FrameError::UnknownFrame(_))
        ));

        seed_map.insert("arm".to_owned(), vec![0.1, 0.2]);
        let q = arm.map_to_slice(&seed_map).unwrap();
        assert_relative_eq!(q[0], 0.1);
        assert_relative_eq!(q[1], 0.2);
    }

    #[test]
    fn ik_recovers_a_known_configuration() {
        let arm = planar_arm();
        let target = [FRAC_PI_4, FRAC_PI_4];
        let goal = arm.transform(&target).unwrap();
        let metric = square_pose_metric();
        let mut rng = StdRng::seed_from_u64(11);
        let solutions = arm
            .solve_ik(&Context::background(), &goal, &[0.0, 0.0], &metric, &mut rng, 4)
            .unwrap();
        assert!(!solutions.is_empty());
        let best = &solutions[0];
        assert_relative_eq!(best[0], target[0], epsilon = 1e-5);
        assert_relative_eq!(best[1], target[1], epsilon = 1e-5);
    }

    #[test]
    fn ik_finds_nothing_out_of_reach() {
        let arm = planar_arm();
        let goal = Pose::translation(5.0, 0.0, 0.0);
        let metric = square_pose_metric();
        let mut rng = StdRng::seed_from_u64(11);
        let solutions = arm
            .solve_ik(&Context::background(), &goal, &[0.0, 0.0], &metric, &mut rng, 4)
            .unwrap();
        assert!(solutions.is_empty());
    }

    #[test]
    fn static_frame_system_reexpresses_poses() {
        let mut fs = StaticFrameSystem::new();
        fs.add_frame("camera", Pose::translation(1.0, 0.0, 0.0));
        let goal = PoseInFrame::new("camera", Pose::translation(0.5, 0.0, 0.0));
        let in_world = fs
            .transform_pose(&SeedMap::new(), &goal, WORLD_FRAME)
            .unwrap();
        assert_relative_eq!(in_world.pose.translation.x, 1.5, epsilon = 1e-12);
    }
}
