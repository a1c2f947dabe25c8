pub mod rules;
pub mod upstream;

pub use rules::*;
pub use upstream::*;
