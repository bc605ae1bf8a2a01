// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::Connector;
pub use protocol::{Protocol, TcpProtocol};
pub use server::Server;
