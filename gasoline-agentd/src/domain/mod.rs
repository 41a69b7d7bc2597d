pub mod annotation;
pub mod capture;
pub mod command;
pub mod query;
pub mod session;
pub mod tool_error;
