// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_camera;
pub mod acquisition_state;
pub mod capture_loop;
pub mod controller;
pub mod display;
pub mod frame_rate;
pub mod image_camera;
pub mod lut;
pub mod wait_monitor;
