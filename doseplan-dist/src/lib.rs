pub mod comm;
pub mod distribute;
pub mod evaluator;
#[cfg(feature = "solver")]
pub mod solver;
pub mod transport;

pub use comm::mem::MemComm;
pub use comm::tcp::TcpComm;
pub use comm::{Body, CommError, Communicator, Message, Tag, COORDINATOR};
pub use evaluator::{serve, worker_run, DistributedEvaluator};
pub use transport::{LocalData, LocalEntry};
