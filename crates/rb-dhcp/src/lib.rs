pub mod lease;
pub mod listener;
pub mod options;
pub mod packet;
pub mod relay;
pub mod server;
pub mod transaction;

pub use lease::{Lease, LeaseTable};
pub use packet::{DhcpPacket, DhcpParseError};
pub use transaction::TransactionSet;
