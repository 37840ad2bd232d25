pub mod clock;
pub mod error;
pub mod ids;

pub use clock::*;
pub use error::*;
pub use ids::*;
