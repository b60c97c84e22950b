// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod cloud;
pub mod config;
pub mod control;
pub mod envcfg;
pub mod error;
pub mod frame_pump;
pub mod model;
pub mod mux;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod wire;


