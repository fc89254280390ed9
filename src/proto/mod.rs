//! Wire-protocol internals: the HTTP/1.x codec and the HTTP/2 engine.

pub mod h1;
pub mod h2;
