pub mod podcleanuppolicy;

pub use podcleanuppolicy::*;
