pub mod settings;

pub use settings::SessionConfig;
