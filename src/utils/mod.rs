//! Utility functions shared across the codebase

pub mod similarity;

// Re-export commonly used utilities
pub use similarity::overlap_score;
