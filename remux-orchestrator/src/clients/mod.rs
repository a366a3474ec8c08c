pub mod history;
pub mod integrity;
pub mod links;
pub mod plugins;
