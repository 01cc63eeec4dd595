//! Wire messages and inbound request handling.

pub mod handler;
pub mod rpc;

pub use handler::MessageHandler;
pub use rpc::{
    decode_request, decode_response, encode_request, encode_response, ClusterRequest,
    ClusterResponse, WireError,
};
