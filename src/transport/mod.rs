pub mod packet;
pub mod rest;
pub mod socket;

pub use rest::RestClient;
pub use socket::{handler, ConnectionState, Handler, SocketClient};
