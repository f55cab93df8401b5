//! Remote control plane: RPC-over-HTTP endpoints, reconnecting clients,
//! and the master/slave roles built on them.

pub mod client;
pub mod endpoint;
pub mod master;
pub mod slave;

pub use client::{ClientState, EndpointClient};
pub use endpoint::{Endpoint, EndpointContext, EndpointState, RpcRequest, RpcResponse};
pub use master::{Master, SlaveHandle};
pub use slave::{MethodRegistry, SlaveMethod, SlaveNode, SlaveSpec};
