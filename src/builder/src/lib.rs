//! Kiln Builder - Dockerfile interpreter.
//!
//! Consumes a build context (a tar archive with a Dockerfile) and drives
//! an ordered sequence of image layers out of it. The builder never
//! touches container internals itself: tar extraction, base-image
//! installation, and command execution are emitted as tasks an external
//! host fulfils and reports back.
//!
//! # Usage
//!
//! ```no_run
//! use kiln_builder::{BuildSession, SessionOptions};
//! use kiln_core::event::EventSender;
//!
//! # async fn build() -> kiln_core::Result<()> {
//! let (events, _rx) = EventSender::channel();
//! let session = BuildSession::new(SessionOptions {
//!     work_dir: "/var/tmp/build".into(),
//!     container_root_dir: "/zones/z1/root".into(),
//!     context_filepath: Some("/var/tmp/context.tar".into()),
//!     uuid: "7b8f68a6-4342-49ae-9ac2-55ad7a08e477".into(),
//!     ..SessionOptions::default()
//! })?;
//! // ... spawn a host loop draining `_rx` and answering tasks ...
//! let _result = session.run(events).await?;
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod cache;
pub mod context;
pub mod copy;
pub mod dockerfile;
pub mod engine;
pub mod image;
pub mod safepath;
pub mod session;
pub mod shellword;
mod steps;

// Re-export common types
pub use engine::{BuildResult, DEFAULT_DOCKERFILE_NAME, MAX_DOCKERFILE_SIZE};
pub use image::{ImageConfig, ImageState, InstalledImage, Layer};
pub use session::{BuildSession, CommandType, SessionOptions};

pub use kiln_core::error::{KilnError, Result};
pub use kiln_core::event::{BuildEvent, EventSender};

/// Kiln builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
