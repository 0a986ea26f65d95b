//! Protobuf frames exchanged between cache nodes.

/// Query for one key in one group, carried in the request path.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CacheRequest {
    #[prost(string, tag = "1")]
    pub group: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

/// Value payload returned by the owning node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CacheResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
}
