pub mod audit;
pub mod builder;
pub mod cache;
pub mod caom;
pub mod config;
pub mod context;
pub mod fs_repo;
pub mod http;
pub mod overrides;
pub mod paths;
pub mod pipeline;
pub mod reconcile;
pub mod record;
pub mod repository;
pub mod resolve;
pub mod scan;
pub mod stale;
pub mod tree;
pub mod uri;
pub mod util;
pub mod warn;
