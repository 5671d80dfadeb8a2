pub mod config;
pub mod convert;
pub mod error;
pub mod link;
pub mod migrate;
pub mod record;
pub mod resolver;
pub mod routing;
pub mod runtime;
pub mod slugs;
pub mod storage;
