// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Utility modules
//!
//! Common utilities for the gantry CLI.

pub mod colors;
pub mod format;
pub mod spinner;

pub use colors::*;
pub use format::*;
pub use spinner::*;
