pub mod config;
pub mod forge;
pub mod lifecycle;
pub mod llm;
pub mod store;
pub mod terminal;
pub mod vault;
