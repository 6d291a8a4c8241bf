pub mod commit;
pub mod config;
pub mod context;
pub mod engine;
pub mod errors;
pub mod host;
pub mod init;
pub mod model;
pub mod music;
pub mod orchestrator;
pub mod partgen_config;
pub mod profiles;
pub mod settings;
pub mod task;
pub mod tempo;
pub mod ui;
pub mod util;
