pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod multipart;
pub mod pipeline;
pub mod translate;

pub use cache::{CompileParams, derive_cache_paths, needs_recompilation};
pub use config::HostConfig;
pub use context::{PageContext, execute_page};
pub use engine::{LuaEngine, PageRuntime};
pub use pipeline::{PageError, compile_page};
pub use translate::{LuaTranslator, TemplateTranslator};
