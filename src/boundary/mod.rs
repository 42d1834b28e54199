//! Contrastive boundary checking.
//!
//! For each task the engine constructs a deliberately absurd alternative
//! answer and measures how far the real result sits from it. The contrast
//! bounds what the real answer can and cannot mean; a real answer that
//! lands suspiciously close to the absurd one is flagged rather than
//! accepted.

pub mod engine;
pub mod types;

pub use engine::BoundaryEngine;
pub use types::{
    FinalValidation, PugachevCobraResult, RidiculousSolution, ValidationBoundaries,
    ValidationSpace,
};
