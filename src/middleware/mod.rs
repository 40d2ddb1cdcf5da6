pub mod admission;
pub mod request_logger;
