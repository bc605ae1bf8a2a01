// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod consistency;
pub mod cursor;
pub mod errors;
pub mod network;
pub mod parallel;
pub mod storage;
pub mod telemetry;
pub mod thl;
pub mod watermark;
