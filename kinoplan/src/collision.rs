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

use crate::world::{Geometry, COLLISION_BUFFER};
use std::collections::BTreeMap;

/// A pair of named geometries in collision, with the Euclidean distance one
/// of them would have to be moved to resolve the contact.
#[derive(Debug, Clone, PartialEq)]
pub struct Collision {
    pub name1: String,
    pub name2: String,
    pub penetration_depth: f64,
}

/// Pairwise distances between two sets of named geometries, keyed by
/// unordered pair. A stored NaN marks a pair to ignore: IEEE comparisons
/// with NaN are false, so an ignored pair never reads as a collision.
#[derive(Debug, Clone, Default)]
pub struct CollisionGraph {
    distances: BTreeMap<(String, String), f64>,

    /// When false, graph construction stops at the first collision found and
    /// records only infinities and that one collision, skipping the
    /// remaining exact distance queries.
    report_distances: bool,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_owned(), b.to_owned())
    } else {
        (b.to_owned(), a.to_owned())
    }
}

impl CollisionGraph {
    /// Build the graph between geometry sets `x` and `y`, comparing every
    /// cross pair. If `y` is None the graph is built within `x` itself.
    /// Pairs that collide in `reference` are written as NaN so contact that
    /// already exists at the seed configuration is never reported again.
    pub fn build(
        x: &[(String, Geometry)],
        y: Option<&[(String, Geometry)]>,
        reference: Option<&CollisionGraph>,
        report_distances: bool,
    ) -> Self {
        let y = y.unwrap_or(x);
        let mut graph = CollisionGraph {
            distances: BTreeMap::new(),
            report_distances,
        };

        for (x_name, x_geometry) in x {
            for (y_name, y_geometry) in y {
                if x_name == y_name || graph.distance_between(x_name, y_name).is_some() {
                    continue;
                }
                let distance = if reference.map_or(false, |r| r.collision_between(x_name, y_name)) {
                    f64::NAN
                } else {
                    x_geometry.distance_from(y_geometry)
                };
                graph
                    .distances
                    .insert(pair_key(x_name, y_name), distance);
                if !report_distances && distance <= COLLISION_BUFFER {
                    return graph;
                }
            }
        }
        graph
    }

    /// The stored distance for a pair, in either name order.
    pub fn distance_between(&self, name1: &str, name2: &str) -> Option<f64> {
        self.distances.get(&pair_key(name1, name2)).copied()
    }

    pub fn collision_between(&self, name1: &str, name2: &str) -> bool {
        self.distance_between(name1, name2)
            .map_or(false, |d| d <= COLLISION_BUFFER)
    }

    /// All colliding pairs currently stored in the graph.
    pub fn collisions(&self) -> Vec<Collision> {
        let mut found = Vec::new();
        for ((name1, name2), distance) in &self.distances {
            if *distance <= COLLISION_BUFFER {
                found.push(Collision {
                    name1: name1.clone(),
                    name2: name2.clone(),
                    penetration_depth: *distance,
                });
                if !self.report_distances {
                    return found;
                }
            }
        }
        found
    }

    /// Mark a pair as something never to check for or report.
    pub fn ignore(&mut self, name1: &str, name2: &str) {
        self.distances.insert(pair_key(name1, name2), f64::NAN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Point;

    fn spheres(layout: &[(&str, f64, f64)]) -> Vec<(String, Geometry)> {
        layout.iter()
            .map(|(name, x, radius)| {
                (
                    (*name).to_owned(),
                    Geometry::sphere(Point::new(*x, 0.0, 0.0), *radius),
                )
            })
            .collect()
    }

    #[test]
    fn detects_overlapping_pair_once() {
        let set = spheres(&[("a", 0.0, 1.0), ("b", 1.5, 1.0), ("c", 10.0, 1.0)]);
        let graph = CollisionGraph::build(&set, None, None, true);
        let collisions = graph.collisions();
        assert_eq!(collisions.len(), 1);
        assert!(graph.collision_between("a", "b"));
        assert!(graph.collision_between("b", "a"));
        assert!(!graph.collision_between("a", "c"));
    }

    #[test]
    fn reference_collisions_are_ignored() {
        let set = spheres(&[("a", 0.0, 1.0), ("b", 1.5, 1.0)]);
        let reference = CollisionGraph::build(&set, None, None, true);
        assert!(reference.collision_between("a", "b"));

        let rebuilt = CollisionGraph::build(&set, None, Some(&reference), true);
        assert!(rebuilt.collisions().is_empty());
        assert!(rebuilt.distance_between("a", "b").unwrap().is_nan());
    }

    #[test]
    fn explicit_ignore_suppresses_reporting() {
        let set = spheres(&[("a", 0.0, 1.0), ("b", 1.5, 1.0)]);
        let mut graph = CollisionGraph::build(&set, None, None, true);
        graph.ignore("b", "a");
        assert!(graph.collisions().is_empty());
    }

    #[test]
    fn early_exit_mode_stops_at_first_collision() {
        let set = spheres(&[("a", 0.0, 1.0), ("b", 0.5, 1.0), ("c", 1.0, 1.0)]);
        let graph = CollisionGraph::build(&set, None, None, false);
        assert_eq!(graph.collisions().len(), 1);
    }

    #[test]
    fn cross_set_comparison_skips_within_set_pairs() {
        let mechanism = spheres(&[("link0", 0.0, 1.0), ("link1", 0.5, 1.0)]);
        let obstacles = spheres(&[("wall", 10.0, 1.0)]);
        let graph = CollisionGraph::build(&mechanism, Some(&obstacles), None, true);
        // link0/link1 overlap but are not a cross pair
        assert!(graph.collisions().is_empty());
        assert!(graph.distance_between("link0", "link1").is_none());
        assert!(graph.distance_between("link0", "wall").is_some());
    }
}
