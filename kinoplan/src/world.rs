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

use crate::spatial::{Point, Pose, Vector};
use std::collections::BTreeMap;

/// Geometry pairs separated by no more than this distance are considered to
/// be in collision.
pub const COLLISION_BUFFER: f64 = 1e-8;

/// A rigid collision geometry, posed in world coordinates.
#[derive(Debug, Clone)]
pub enum Geometry {
    Sphere { center: Point, radius: f64 },
    Cuboid { pose: Pose, half_extents: Vector },
}

impl Geometry {
    pub fn sphere(center: Point, radius: f64) -> Self {
        Geometry::Sphere { center, radius }
    }

    pub fn cuboid(pose: Pose, half_extents: Vector) -> Self {
        Geometry::Cuboid { pose, half_extents }
    }

    /// Separation distance to another geometry. A negative value is the
    /// penetration depth: how far one geometry would need to move to resolve
    /// the overlap. Sphere pairs and sphere/cuboid pairs are exact;
    /// cuboid/cuboid is estimated by corner sampling and may overstate
    /// separation for edge-to-edge contact.
    pub fn distance_from(&self, other: &Geometry) -> f64 {
        match (self, other) {
            (
                Geometry::Sphere { center: a, radius: ra },
                Geometry::Sphere { center: b, radius: rb },
            ) => (a - b).norm() - ra - rb,
            (Geometry::Sphere { center, radius }, Geometry::Cuboid { pose, half_extents }) => {
                signed_point_distance(center, pose, half_extents) - radius
            }
            (Geometry::Cuboid { .. }, Geometry::Sphere { .. }) => other.distance_from(self),
            (
                Geometry::Cuboid { pose: pa, half_extents: ha },
                Geometry::Cuboid { pose: pb, half_extents: hb },
            ) => {
                let mut best = f64::INFINITY;
                for corner in corners(pa, ha) {
                    best = best.min(signed_point_distance(&corner, pb, hb));
                }
                for corner in corners(pb, hb) {
                    best = best.min(signed_point_distance(&corner, pa, ha));
                }
                best
            }
        }
    }
}

/// Signed distance from a point to a posed cuboid: positive outside the
/// surface, negative inside.
fn signed_point_distance(point: &Point, pose: &Pose, half_extents: &Vector) -> f64 {
    let local = pose.inverse_transform_point(point);
    let excess = Vector::new(
        local.x.abs() - half_extents.x,
        local.y.abs() - half_extents.y,
        local.z.abs() - half_extents.z,
    );
    let outside = Vector::new(excess.x.max(0.0), excess.y.max(0.0), excess.z.max(0.0));
    let outside_distance = outside.norm();
    if outside_distance > 0.0 {
        outside_distance
    } else {
        // inside: distance to the nearest face
        excess.x.max(excess.y).max(excess.z)
    }
}

fn corners(pose: &Pose, half_extents: &Vector) -> [Point; 8] {
    let mut out = [Point::origin(); 8];
    for (i, corner) in out.iter_mut().enumerate() {
        let sx = if i & 1 == 0 { -1.0 } else { 1.0 };
        let sy = if i & 2 == 0 { -1.0 } else { 1.0 };
        let sz = if i & 4 == 0 { -1.0 } else { 1.0 };
        *corner = pose.transform_point(&Point::new(
            sx * half_extents.x,
            sy * half_extents.y,
            sz * half_extents.z,
        ));
    }
    out
}

/// The set of named obstacle geometries known to the planner. Read-only for
/// the duration of a plan request.
#[derive(Debug, Clone, Default)]
pub struct WorldState {
    obstacles: BTreeMap<String, Geometry>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_obstacle(&mut self, name: impl Into<String>, geometry: Geometry) {
        self.obstacles.insert(name.into(), geometry);
    }

    pub fn obstacles(&self) -> impl Iterator<Item = (&String, &Geometry)> {
        self.obstacles.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.obstacles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_separation_and_penetration() {
        let a = Geometry::sphere(Point::new(0.0, 0.0, 0.0), 1.0);
        let b = Geometry::sphere(Point::new(3.0, 0.0, 0.0), 1.0);
        assert_relative_eq!(a.distance_from(&b), 1.0, epsilon = 1e-12);

        let c = Geometry::sphere(Point::new(1.5, 0.0, 0.0), 1.0);
        assert_relative_eq!(a.distance_from(&c), -0.5, epsilon = 1e-12);
    }

    #[test]
    fn sphere_to_cuboid_distance_is_symmetric() {
        let sphere = Geometry::sphere(Point::new(3.0, 0.0, 0.0), 0.5);
        let cuboid = Geometry::cuboid(Pose::identity(), Vector::new(1.0, 1.0, 1.0));
        assert_relative_eq!(sphere.distance_from(&cuboid), 1.5, epsilon = 1e-12);
        assert_relative_eq!(cuboid.distance_from(&sphere), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn point_inside_cuboid_reports_penetration() {
        let sphere = Geometry::sphere(Point::new(0.25, 0.0, 0.0), 0.0);
        let cuboid = Geometry::cuboid(Pose::identity(), Vector::new(1.0, 1.0, 1.0));
        assert!(sphere.distance_from(&cuboid) < 0.0);
    }
}
