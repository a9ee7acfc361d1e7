//! Static analysis for submitted code: the security/secret gate, dependency
//! detection, input sanitising and quality scoring.
//!
//! Everything here except the tool-backed quality stages is pure and does no
//! I/O.

mod python;

pub mod deps;
pub mod error;
pub mod gate;
pub mod quality;
pub mod sanitize;

pub use error::{Error, Result};
pub use gate::{PythonGate, StaticAnalyzer};
pub use quality::{QualityGate, QualityReport, QualityWeights};
