// Core modules: store access, streaming stages, caching, and error modeling.
pub mod backend;
pub mod cache;
pub mod error;
pub mod executor;
pub mod paginate;
pub mod query;
pub mod record;
pub mod scope;
pub mod stage;
pub mod stream;
pub mod window;
