pub mod models;
pub mod normalize;
pub mod channel;
pub mod prefs;
pub mod report;
pub mod auth;
pub mod feed;
pub mod reconcile;

pub use models::*;
