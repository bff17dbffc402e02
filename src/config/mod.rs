pub mod defaults;
pub mod route;
pub mod service;
pub mod settings;
