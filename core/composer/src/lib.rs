pub mod api;
pub mod composer;
pub mod config;
pub mod templates;

pub use api::{create_router, ComposerState};
pub use composer::{estimate_tokens, Composer};
pub use config::ComposerConfig;
pub use templates::TemplateRenderer;
