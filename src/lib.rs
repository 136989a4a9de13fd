pub mod backend;
pub mod config;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod session;
pub mod state;
pub mod sync;
#[cfg(test)]
pub(crate) mod test_support;
pub mod tools;
pub mod transport;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{BackendError, ChannelClosed, InvocationError, PatchError, StoreError};
pub use session::{Session, SessionHandle};
