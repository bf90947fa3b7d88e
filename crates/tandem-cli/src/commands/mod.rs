pub mod collection;
pub mod common;
pub mod note;
pub mod queue;
pub mod setting;
pub mod sync;
