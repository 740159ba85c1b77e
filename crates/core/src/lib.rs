pub mod codec;
pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use codec::*;
pub use config::*;
pub use error::*;
pub use models::*;
pub use traits::*;
