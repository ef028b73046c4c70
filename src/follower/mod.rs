// CT log follower
//
// A resumable, windowed, parallel fetcher per log: checkpoint resume →
// get-sth → window planner → fetch worker pool → ingest worker pool →
// reorder-buffer checkpointer.

pub mod client;
pub mod engine;
pub mod leaf;
pub mod windows;

pub use client::{LogClient, RawEntry, SignedTreeHead};
pub use engine::{FollowerConfig, LogFollower};
pub use leaf::{EntryType, ParsedEntry};
pub use windows::{plan_windows, ReorderBuffer, Window};
