//! Error types for the compositor.
//!
//! Two layers: [`GpuError`] is what a [`GpuBackend`](crate::GpuBackend) reports,
//! [`FeedError`] is what the engine surfaces to callers. Most GPU failures never
//! reach the caller; the engine logs them and degrades (pass-through operations,
//! black output) instead.

use crate::graph::NodeId;

pub type FeedResult<T> = Result<T, FeedError>;
pub type GpuResult<T> = Result<T, GpuError>;

/// Failures reported by a GPU backend.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("allocation failed for `{label}`: {message}")]
    Allocation { label: String, message: String },

    #[error("shader program `{label}` failed to link: {message}")]
    ShaderLink { label: String, message: String },

    #[error("unknown {kind} handle {id}")]
    UnknownResource { kind: &'static str, id: u64 },

    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("buffer {0} mapped before its fence signaled")]
    TornRead(u64),

    #[error("device error: {0}")]
    Device(String),
}

impl GpuError {
    pub fn allocation(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Allocation {
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn shader_link(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ShaderLink {
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }
}

/// Failures surfaced by the engine API.
#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    /// The base rendering context could not be created. This is the only fatal
    /// condition: the engine cannot start without it.
    #[error("rendering context unavailable: {0}")]
    Context(String),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    pub fn context(msg: impl Into<String>) -> Self {
        Self::Context(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }
}
