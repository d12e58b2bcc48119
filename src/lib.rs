//! # tidal-dl
//!
//! Acquisition pipeline for tracks and videos from a streaming service.
//!
//! Each submitted item moves through manifest resolution, concurrent segment
//! fetching, streaming decryption, optional lossless container normalisation
//! and atomic placement on disk. Argument parsing, configuration files, file
//! naming templates and tag writing are left to the embedding application and
//! plug in through [`Collaborators`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidal_dl::{Acquirer, Collaborators, Config, parse_identifier, run_until_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.api.access_token = Some("...".to_string());
//!     tidal_dl::logging::init_logging(&config.logging)?;
//!
//!     let acquirer = Acquirer::new(config.clone(), Collaborators::http(&config)?).await?;
//!
//!     // Subscribe to events
//!     let mut events = acquirer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let album = parse_identifier("https://tidal.com/browse/album/77646164")?;
//!     acquirer.submit_collection(album).await?;
//!
//!     tokio::spawn(run_until_signal(acquirer.clone()));
//!     let summary = acquirer.wait_all().await;
//!     println!("{}", summary.to_json()?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Acquisition orchestrator
pub mod acquisition;
/// Configuration types
pub mod config;
/// Stream decryption
pub mod decrypt;
/// Error types
pub mod error;
/// Segment fetching
pub mod fetch;
/// Identifier parsing
pub mod identifier;
/// Shared network limits
pub mod limiter;
/// Logging setup
pub mod logging;
/// Stream manifests and resolvers
pub mod manifest;
/// Retry logic with exponential backoff
pub mod retry;
/// Lossless container normalisation
pub mod transcode;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use acquisition::{Acquirer, Collaborators, FlatPathPlanner, NoOpTagger, PathPlanner, Tagger};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use identifier::{parse_batch, parse_identifier};
pub use types::{
    AudioQuality, BatchSummary, Event, ItemDescriptor, ItemKind, LifecycleState,
    QualitySelection, TaskId, TaskOutcome, TaskResult, TaskStatus, VideoQuality,
};

/// Run until a termination signal arrives, then shut the acquirer down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// In-flight items unwind as cancelled and leave no partial files behind.
///
/// # Example
///
/// ```no_run
/// use tidal_dl::{Acquirer, Collaborators, Config, run_until_signal};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let acquirer = Acquirer::new(config.clone(), Collaborators::http(&config)?).await?;
///
///     run_until_signal(acquirer).await;
///     Ok(())
/// }
/// ```
pub async fn run_until_signal(acquirer: Acquirer) {
    wait_for_signal().await;
    acquirer.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
