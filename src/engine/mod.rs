pub mod pipeline;
pub mod results;
pub mod signal;

pub use pipeline::RegimePipeline;
