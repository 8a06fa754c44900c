//! Runtime components for process supervision and dependency-ordered launch

pub mod composable;
pub mod events;
pub mod health;
pub mod launcher;
pub mod output;
pub mod process;
pub mod resolver;

pub use composable::*;
pub use events::*;
pub use health::*;
pub use launcher::*;
pub use output::*;
pub use process::*;
pub use resolver::*;
