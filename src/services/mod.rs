pub mod cache;
pub mod dispatcher;
pub mod key_pool;
pub mod translate;
pub mod upstream;
