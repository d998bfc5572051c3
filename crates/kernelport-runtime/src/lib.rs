pub mod repository;
pub mod request;
pub mod scheduler;
pub mod worker;

pub use repository::*;
pub use request::*;
pub use scheduler::*;
pub use worker::*;
