//! Client-side core of the ad-intelligence dashboard: background task
//! tracking, paginated list loading with prefetch, and the task store.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod image_proxy;
pub mod knowledge;
pub mod model;
pub mod pager;
pub mod poller;
