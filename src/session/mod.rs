pub mod command;
pub mod controller;
pub mod state;

pub use command::Command;
pub use controller::SessionController;
pub use state::SessionState;
