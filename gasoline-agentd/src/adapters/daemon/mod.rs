mod process;
pub mod signals;

pub use process::ProcessDaemonControl;
