pub mod logging;
pub mod paths;
pub mod settings;
pub mod state;
pub mod updates;

pub mod app;
pub mod db;
pub mod media;
pub mod telegram;
