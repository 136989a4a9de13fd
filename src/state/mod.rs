mod mirror;
mod store;

pub use mirror::{MirrorUpdate, StateMirror};
pub use store::{Applied, StateChange, StateStore};
