//! Post-decision risk controls: the durable signal cooldown, the open
//! position book and the trailing stop engine behind it.

pub mod cooldown;
pub mod position_book;
pub mod state_store;
pub mod trailing_stop;
#[cfg(test)]
mod tests;

pub use cooldown::{
    CooldownCheck, CooldownConfig, CooldownRecord, CooldownScope, CooldownState, CooldownTracker,
};
pub use position_book::{ExitEvent, Fill, Position, PositionBook, PositionError};
pub use state_store::StateStore;
pub use trailing_stop::{ExitReason, StopEvent, TrailingConfig, TrailingPhase, TrailingStop};
