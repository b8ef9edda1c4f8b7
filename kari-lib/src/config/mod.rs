pub mod loader;
pub mod types;
pub mod validator;

pub use loader::{load_from_path, save_to_path, EngineSnapshot};
pub use types::{
    ImpairmentConfig, InterfaceConfig, InterfaceType, Protocol, TrafficProfile,
};
pub use validator::{validate_interface, validate_profile};
