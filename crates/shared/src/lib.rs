//! Types shared between the room server and the client engine: id newtypes,
//! the room event model, and the websocket wire envelope.

pub mod domain;
pub mod error;
pub mod event;
pub mod protocol;
