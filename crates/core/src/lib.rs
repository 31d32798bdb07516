pub mod config;
pub mod error;
pub mod params;
pub mod value;
pub mod view;

pub use config::Config;
pub use error::*;
pub use params::ParameterBinder;
pub use value::ConfigValue;
pub use view::*;
