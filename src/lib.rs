//! Frame-execution core for a real-time Vulkan renderer: frame
//! pacing, swapchain presentation, render-target lifecycle,
//! multithreaded command recording, descriptor table management
//! and packed geometry storage.

pub mod attachments;
pub mod buffers;
pub mod commands;
pub mod context;
pub mod descriptors;
pub mod display;
pub mod dynamic_state;
pub mod error;
pub mod geometry;
pub mod image;
pub mod pipeline;
pub mod queues;
pub mod render_target;
pub mod shaders;
pub mod swapchain;
pub mod sync;
pub mod workers;

pub use context::Context;
pub use display::Display;
pub use error::is_fatal;
pub use render_target::{Frame, RenderTarget};
pub use workers::{DrawRecorder, RecordScope, WorkerPool};
