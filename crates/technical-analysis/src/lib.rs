pub mod indicators;
pub mod price_action;
pub mod snapshot;


pub use indicators::*;
pub use price_action::*;
pub use snapshot::*;
