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

//! Collision-free kinematic motion planning for articulated mechanisms.
//!
//! The entry point is [`PlanManager`]: given a goal pose, a current joint
//! state, a world model, and an untyped bundle of planning options, it
//! decomposes the request into atomic waypoints, runs one sampling planner
//! per waypoint with pipelined look-ahead, races a fallback planner when
//! the first result is not good enough, and returns the concatenated path
//! or a precise error.

pub mod collision;

pub mod constraint;

pub mod context;
pub use context::Context;

pub mod error;
pub use error::PlanError;

pub mod frame;
pub use frame::{Config, Frame, FrameSystem, SeedMap};

pub mod manager;
pub use manager::PlanManager;

pub mod options;

pub mod planner;
pub use planner::PathPlanner;

pub mod rrt;

pub mod spatial;
pub use spatial::Pose;

pub mod world;
pub use world::WorldState;

pub mod prelude {
    pub use super::constraint::*;
    pub use super::context::*;
    pub use super::error::*;
    pub use super::frame::*;
    pub use super::manager::*;
    pub use super::options::*;
    pub use super::planner::*;
    pub use super::spatial::*;
    pub use super::world::*;
}
