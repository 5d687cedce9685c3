// Utility modules
pub mod command;
pub mod disk;
pub mod files;
pub mod logging;
pub mod path_resolver;
