//! aeroflow - barrier-aligned messaging and chained checkpoint logs for
//! stream processing tasks
//!
//! - `messaging`: deduplicating subscribers that align on epoch barriers
//! - `checkpoint`: batched, compactable window-state logs and their playback

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod messaging;
pub mod observability;
