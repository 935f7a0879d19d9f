pub mod arch;
pub mod config;
pub mod result;
pub mod errors;

pub use arch::*;
pub use config::*;
pub use result::*;
pub use errors::*;
