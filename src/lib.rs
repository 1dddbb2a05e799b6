//! quadro — an asynchronous bridge between an embedded Neovim backend and
//! a GPU-rendered front-end.
//!
//! The backend runs as a child process speaking msgpack-rpc over stdio. A
//! background reader thread queues redraw batches and pushed option changes;
//! the single application thread drains both once per tick, folds the
//! batches into cell grids, and uploads the resulting geometry through a
//! patch-or-reallocate buffer policy. A fixed local TCP port coordinates
//! single-instance launches on the same machine.

pub mod editor;
pub mod error;
pub mod grid;
pub mod input;
pub mod ipc;
pub mod nvim;
pub mod queue;
pub mod render;

pub use editor::{Options, Session};
pub use error::{Error, Result};
pub use nvim::NvimClient;
