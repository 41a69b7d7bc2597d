pub mod annotations;
pub mod capture;
pub mod dispatch;
pub mod extension;
pub mod session;
pub mod tools;
