#[cfg(feature="driver")]
mod robot_interface;
#[cfg(feature="driver")]
pub use robot_interface::*;

#[cfg(feature="driver")]
mod legacy;
#[cfg(feature="driver")]
pub use legacy::*;

#[cfg(feature="driver")]
mod extended;

#[cfg(feature="driver")]
mod handle;
#[cfg(feature="driver")]
pub use handle::*;

mod models;
pub use models::*;

mod routing;
pub use routing::*;

mod config;
pub use config::*;
