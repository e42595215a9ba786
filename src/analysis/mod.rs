//! One analysis end to end: prompt, stream, script dispatch, recovery and
//! report rendering.

pub mod audit;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod render;
pub mod session;

pub use error::AnalysisError;
pub use orchestrator::{AnalysisService, AnalysisSettings};
pub use registry::AnalysisRegistry;
pub use session::{ContentItem, ReportView, StartAnalysisRequest};
