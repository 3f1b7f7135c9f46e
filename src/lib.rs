pub mod config;
pub mod context;
pub mod envelope;
pub mod flow;
pub mod gateway;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod registry;
pub mod server;
pub mod stream;
pub mod topics;

pub use context::{FlowContext, Status};
pub use flow::{Flow, FlowBuilder, FlowError};
pub use node::{ExecInput, Node, NodeError};
pub use registry::TaskRegistry;
pub use stream::{OutputChannel, StreamItem};
