pub mod app;
pub mod cli;
pub mod config;
pub mod debounce;
pub mod model;
pub mod realtime;
pub mod resolver;
pub mod scrape;
pub mod search;
pub mod storage;
pub mod store;
pub mod validate;

pub use app::{Session, SessionEvent};
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use model::{Bookmark, BookmarkId, NewBookmark};
pub use store::BookmarkStore;
pub use validate::is_valid_url;
