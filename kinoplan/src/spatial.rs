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

pub type Pose = nalgebra::Isometry3<f64>;
pub type Point = nalgebra::Point3<f64>;
pub type Vector = nalgebra::Vector3<f64>;
pub type Orientation = nalgebra::UnitQuaternion<f64>;

/// Interpolate between two poses: linear in position, SLERP in orientation.
/// `by` is clamped to [0, 1].
pub fn interpolate(from: &Pose, to: &Pose, by: f64) -> Pose {
    let by = by.clamp(0.0, 1.0);
    let translation = from.translation.vector.lerp(&to.translation.vector, by);
    let rotation = from
        .rotation
        .try_slerp(&to.rotation, by, 1e-9)
        .unwrap_or_else(|| if by < 0.5 { from.rotation } else { to.rotation });
    Pose::from_parts(translation.into(), rotation)
}

/// Separation between two poses as (translation distance, rotation angle).
pub fn pose_delta(a: &Pose, b: &Pose) -> (f64, f64) {
    let translation = (b.translation.vector - a.translation.vector).norm();
    let rotation = a.rotation.angle_to(&b.rotation);
    (translation, rotation)
}

/// How many atomic sub-waypoints a linear-profile motion between two poses
/// decomposes into, given the requested spacing. Always at least one.
pub fn path_step_count(from: &Pose, to: &Pose, step_size: f64) -> usize {
    let (translation, _) = pose_delta(from, to);
    ((translation / step_size).ceil() as usize).max(1)
}

/// Distance from a point to the segment between `start` and `finish`, and
/// the interpolation parameter of the closest point on that segment.
pub fn point_to_segment(point: &Point, start: &Point, finish: &Point) -> (f64, f64) {
    let segment = finish - start;
    let length_sq = segment.norm_squared();
    if length_sq <= f64::EPSILON {
        return ((point - start).norm(), 0.0);
    }
    let t = ((point - start).dot(&segment) / length_sq).clamp(0.0, 1.0);
    let closest = start + segment * t;
    ((point - closest).norm(), t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pose(x: f64, y: f64, z: f64) -> Pose {
        Pose::translation(x, y, z)
    }

    #[test]
    fn interpolation_endpoints_are_exact() {
        let from = pose(0.0, 0.0, 0.0);
        let to = Pose::new(Vector::new(1.0, 2.0, 3.0), Vector::new(0.0, 0.0, 1.0));
        let at_start = interpolate(&from, &to, 0.0);
        let at_finish = interpolate(&from, &to, 1.0);
        assert_relative_eq!(at_start.translation.vector.norm(), 0.0, epsilon = 1e-12);
        let (dt, dr) = pose_delta(&at_finish, &to);
        assert_relative_eq!(dt, 0.0, epsilon = 1e-12);
        assert_relative_eq!(dr, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn midpoint_bisects_translation() {
        let from = pose(0.0, 0.0, 0.0);
        let to = pose(2.0, 0.0, 0.0);
        let mid = interpolate(&from, &to, 0.5);
        assert_relative_eq!(mid.translation.x, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn step_count_matches_spacing() {
        let from = pose(0.0, 0.0, 0.0);
        let to = pose(1.0, 0.0, 0.0);
        assert_eq!(path_step_count(&from, &to, 0.25), 4);
        assert_eq!(path_step_count(&from, &to, 0.3), 4);
        assert_eq!(path_step_count(&from, &to, 10.0), 1);
    }

    #[test]
    fn segment_distance_projects_inside_and_clamps_outside() {
        let a = Point::new(0.0, 0.0, 0.0);
        let b = Point::new(1.0, 0.0, 0.0);
        let (d, t) = point_to_segment(&Point::new(0.5, 1.0, 0.0), &a, &b);
        assert_relative_eq!(d, 1.0, epsilon = 1e-12);
        assert_relative_eq!(t, 0.5, epsilon = 1e-12);
        let (d, t) = point_to_segment(&Point::new(2.0, 0.0, 0.0), &a, &b);
        assert_relative_eq!(d, 1.0, epsilon = 1e-12);
        assert_relative_eq!(t, 1.0, epsilon = 1e-12);
    }
}
