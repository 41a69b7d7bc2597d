pub mod daemon;
pub mod session;
