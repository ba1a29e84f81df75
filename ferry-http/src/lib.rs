pub mod body;
pub mod chunk;
pub mod client;
pub mod date;
pub mod server;
pub mod util;

pub use body::{BodyStream, ResponseBody};
pub use server::{
    ConnState, ConnectionEnd, HandlerResponse, HttpConnection, RequestHandler, Score,
    ServerRequest, ServerTunables, Tunnel,
};
