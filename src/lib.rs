//! clipwright turns a topic into a finished teaching video: a backend plans
//! an outline and storyboard, per-section scene code is generated and
//! rendered concurrently, and the surviving clips are stitched into one
//! file. Every stage validates its input and retries with corrective
//! feedback before giving up.

pub mod assemble;
pub mod backend;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod outline;
pub mod pipeline;
pub mod prompts;
pub mod reconcile;
pub mod render;
pub mod section;
pub mod stage;
pub mod storyboard;
pub mod usage;
