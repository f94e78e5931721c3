pub mod error;
pub mod requests;
pub mod responses;
pub mod rowset;


pub use error::{ErrorCode, ErrorKind, Result, RpcError, ServerError, TxStage};
pub use requests::{
    generate_request_id, Method, MethodKind, MutationId, RequestId, RpcRequest, TxId, API_SERVICE,
};
pub use responses::RpcResponse;
pub use rowset::{decode_from_wire, encode_to_wire, Column, Row, RowReader, RowsetDescriptor};
