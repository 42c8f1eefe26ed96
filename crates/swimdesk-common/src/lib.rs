//! Shared building blocks for SwimDesk services.

pub mod distributed;
pub mod logging;
