//! Render passes beyond the main scene pass.

mod post_process;

pub use post_process::{LayoutTracker, PostTarget, PostprocessChain, PostprocessPush};
