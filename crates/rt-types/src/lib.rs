pub mod cohort;
pub mod errors;
pub mod params;

pub use cohort::*;
pub use errors::*;
pub use params::*;
