pub mod capture;
pub mod job;
