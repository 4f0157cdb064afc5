//! Enhancer Service
//!
//! AI image enhancement service. Users upload photos, each photo is sent to a
//! generative image model with a fixed restoration instruction, and the
//! enhanced results can be downloaded one at a time or as a single zip archive.
//!
//! ## Features
//!
//! - **Image Store**: Ordered, in-memory records with a per-image status that
//!   can only change through valid transitions
//! - **Remote Enhancement**: One request per image to the Gemini
//!   `generateContent` API, returning the first inline image
//! - **Sequential Batches**: Enhance every idle image one after another from a
//!   snapshot taken at start, with live progress and cancellation
//! - **Archive Download**: Pack all enhanced images into one zip with
//!   `{name}-enhanced.{ext}` entries
//!
//! ## Architecture
//!
//! ```text
//!   HTTP Clients
//!        │
//!        ▼
//! ┌──────────────┐          ┌──────────────┐
//! │ Image API    │─────────▶│ Image        │◀──────────────┐
//! │ (axum)       │          │ Store        │               │
//! └──────────────┘          └──────────────┘               │
//!     │      │                                             │
//!     │      ▼                                             │
//!     │  ┌──────────────┐    ┌──────────────┐     ┌──────────────┐
//!     │  │ Batch        │───▶│ Enhancement  │────▶│ Gemini       │
//!     │  │ Orchestrator │    │ Client       │     │ API          │
//!     │  └──────────────┘    └──────────────┘     └──────────────┘
//!     ▼
//! ┌──────────────┐
//! │ Archive      │──────▶ enhanced-images.zip
//! │ Assembler    │
//! └──────────────┘
//! ```

pub mod api;
pub mod archive;
pub mod batch;
pub mod config;
pub mod enhancement_client;
pub mod image_store;
pub mod status;

pub use api::{AppState, ImageResponse};
pub use archive::{Archive, ArchiveAssembler, ArchiveError, ArchiveStatus};
pub use batch::{BatchError, BatchOrchestrator, BatchProgress, BatchReport, BatchRun};
pub use config::Config;
pub use enhancement_client::{EnhanceError, GeminiEnhancer, ImageEnhancer};
pub use image_store::{ImageRecord, ImageStore, SourceImage, UploadedFile};
pub use status::{EnhancedImage, ImageStatus, StatusKind, Transition, TransitionError};
