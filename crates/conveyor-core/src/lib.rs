pub mod hash;
pub mod retry;
pub mod value;
pub mod work;
pub mod workflow;

mod task_result;
pub use task_result::*;
