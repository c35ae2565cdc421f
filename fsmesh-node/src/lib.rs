//! fsmesh server daemon: configuration, TCP transport and the mesh manager around `FsCore`.

pub mod config;
pub mod mesh;
pub mod transport;
