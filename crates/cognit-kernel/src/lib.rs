mod compose;
mod order;

pub use compose::*;
pub use order::*;
