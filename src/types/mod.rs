pub mod observation;
pub mod signal;

pub use observation::*;
pub use signal::*;
