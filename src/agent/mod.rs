//! Client side of the conversational agent: wire protocol and connection setup.

pub mod connector;
pub mod protocol;
