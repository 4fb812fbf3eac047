mod devtools;
mod http_head;
mod proxy;
mod session;
mod tls;
mod tracer;
mod ws;

pub use devtools::DevtoolsServer;
pub use http_head::{
    header_value, parse_request_head, parse_response_head, read_head, BodyMode, BufferedConn,
    HeaderField, HttpVersion, RequestHead, ResponseHead, MAX_HTTP_HEAD_BYTES,
};
pub use proxy::ProxyServer;
pub use tracer::{NetworkTracer, ResponseDigest};
