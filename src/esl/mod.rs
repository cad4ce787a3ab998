//! # FreeSWITCH Event Socket
//!
//! - `protocol`: message framing and event parsing
//! - `connection`: authenticated connection with `api`, `sendmsg` and event subscription
//! - `backend`: [`EslBackend`], the playback backend used against a live switch
//! - `events`: event listener feeding the lifecycle controller

pub mod backend;
pub mod connection;
pub mod events;
pub mod protocol;

pub use backend::EslBackend;
pub use events::run_event_listener;
