//! Flow-controlled byte streams and the tar transfer built on top of them.
//!
//! A stream connects one [`streams::Writer`] to one [`streams::Reader`], usually living on
//! different hosts. Packets travel through a [`protocol::Transport`]; a [`broker::Broker`] routes
//! the packets of many streams sharing a transport, and [`wire::WireSession`] carries them over a
//! byte pipe. [`tarstream`] moves whole directory trees through a single stream.

pub mod broker;
pub mod cancel;
pub mod protocol;
pub mod streams;
pub mod tarstream;
pub mod wire;
