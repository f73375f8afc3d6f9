//! Command implementations for canflash

pub mod boards;
pub mod commits;
pub mod flash;
mod progress;

pub use boards::boards;
pub use commits::commits;
pub use flash::run;
