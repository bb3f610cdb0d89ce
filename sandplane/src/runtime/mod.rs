mod core;
pub mod options;
pub mod types;

pub use self::core::ControlPlane;
pub use options::SandplaneOptions;
