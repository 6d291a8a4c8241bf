//! CLI command implementations.
//!
//! | Module     | Commands handled                          |
//! |------------|-------------------------------------------|
//! | `project`  | `Init`, `Status`                          |
//! | `generate` | `Generate`, `Compose`, `Arrange`, `Enhance` |
//! | `config`   | `Config`                                  |

pub mod config;
pub mod generate;
pub mod project;

pub use config::cmd_config;
pub use generate::{cmd_compose, cmd_enhance, cmd_generate};
pub use project::{cmd_init, cmd_status};
