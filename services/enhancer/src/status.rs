//! Per-image enhancement state machine.
//!
//! ```text
//!            request              success
//!   Idle ─────────────▶ Enhancing ─────────▶ Success
//!     │                     │                   │
//!     │ reject              │ failure           │ request
//!     ▼                     ▼                   ▼
//!   Error ◀─────────────────┘               Enhancing
//! ```
//!
//! Success and Error are terminal for one invocation. A new request may
//! re-enter Enhancing from either of them.

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Enhanced image payload returned by the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedImage {
    /// Encoded image bytes
    pub data: Bytes,
    /// Media type reported by the service (e.g. "image/png")
    pub media_type: String,
}

/// Lifecycle status of one image record.
///
/// The enhanced payload lives only in `Success` and the failure detail only
/// in `Error`, so neither can be observed in any other state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Idle,
    Enhancing,
    Success(EnhancedImage),
    Error(String),
}

/// Field-less view of [`ImageStatus`] for logs and API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Idle,
    Enhancing,
    Success,
    Error,
}

/// Events that move a record through the state machine
#[derive(Debug, Clone)]
pub enum Transition {
    /// Enhancement requested, remote call about to start
    Request,
    /// Remote call returned an enhanced image
    Succeed(EnhancedImage),
    /// Remote call failed
    Fail(String),
    /// Failure detected before any request was issued
    Reject(String),
}

/// Errors raised when applying a transition
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Cannot apply {transition} to an image in {from} state")]
    Invalid {
        from: StatusKind,
        transition: &'static str,
    },
}

impl ImageStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            ImageStatus::Idle => StatusKind::Idle,
            ImageStatus::Enhancing => StatusKind::Enhancing,
            ImageStatus::Success(_) => StatusKind::Success,
            ImageStatus::Error(_) => StatusKind::Error,
        }
    }

    /// Enhanced payload, present only in Success
    pub fn enhanced(&self) -> Option<&EnhancedImage> {
        match self {
            ImageStatus::Success(image) => Some(image),
            _ => None,
        }
    }

    /// Failure detail, present only in Error
    pub fn error_detail(&self) -> Option<&str> {
        match self {
            ImageStatus::Error(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Success(_) | ImageStatus::Error(_))
    }

    /// Compute the next status, or reject the transition.
    pub fn apply(&self, transition: Transition) -> Result<ImageStatus, TransitionError> {
        match (self, transition) {
            (ImageStatus::Enhancing, Transition::Succeed(image)) => Ok(ImageStatus::Success(image)),
            (ImageStatus::Enhancing, Transition::Fail(detail)) => Ok(ImageStatus::Error(detail)),
            (ImageStatus::Enhancing, t) => Err(self.invalid(&t)),
            (_, Transition::Request) => Ok(ImageStatus::Enhancing),
            (_, Transition::Reject(detail)) => Ok(ImageStatus::Error(detail)),
            (_, t) => Err(self.invalid(&t)),
        }
    }

    fn invalid(&self, transition: &Transition) -> TransitionError {
        TransitionError::Invalid {
            from: self.kind(),
            transition: transition.name(),
        }
    }
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Request => "request",
            Transition::Succeed(_) => "success",
            Transition::Fail(_) => "failure",
            Transition::Reject(_) => "reject",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Idle => "idle",
            StatusKind::Enhancing => "enhancing",
            StatusKind::Success => "success",
            StatusKind::Error => "error",
        };
        f.write_str(s)
    }
}
