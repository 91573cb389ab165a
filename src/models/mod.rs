pub mod error;
pub mod participant;
pub mod cycle;
pub mod reward;
pub mod result;
pub mod quarter;

pub use error::*;
pub use participant::*;
pub use cycle::*;
pub use reward::*;
pub use result::*;
pub use quarter::*;
