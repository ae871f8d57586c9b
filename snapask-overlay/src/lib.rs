pub mod config;
pub mod hotkeys;
pub mod session;
pub mod view_state;
