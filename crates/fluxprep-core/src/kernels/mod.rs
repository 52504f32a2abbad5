//! Stateless numeric corrections. Nothing here knows about datasets or pipelines.

pub mod despike;
pub mod rotation;
mod stats;

use thiserror::Error;

pub use despike::{despike, DespikeOutput, DespikeReport, DEFAULT_SENSITIVITY};
pub use rotation::{
    fit_plane, rotate, rotate_with, PlanarFit, Rotated, RotationAngles, RotationMode,
    RotationParameters,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("component lengths differ: u={u}, v={v}, w={w}")]
    LengthMismatch { u: usize, v: usize, w: usize },
    #[error("{kernel} needs at least {required} complete samples, found {found}")]
    InsufficientData {
        kernel: &'static str,
        required: usize,
        found: usize,
    },
    #[error("{kernel}: {reason}")]
    Degenerate { kernel: &'static str, reason: String },
    #[error("{kernel}: invalid argument {message}")]
    InvalidArgument {
        kernel: &'static str,
        message: String,
    },
}
