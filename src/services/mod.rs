pub mod capture;
pub mod rate_limit;
pub mod render;
pub mod sync;
