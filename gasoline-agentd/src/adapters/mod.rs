pub mod daemon;
pub mod session;
pub mod stdio;
