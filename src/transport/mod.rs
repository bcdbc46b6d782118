pub mod memory;
pub mod tcp;
pub mod traits;

#[cfg(feature = "rfcomm")]
pub mod bt_discovery;
#[cfg(feature = "rfcomm")]
pub mod rfcomm;

pub use memory::{MemoryListener, MemoryNetwork, MemoryStream, MemoryTransport};
pub use tcp::{TcpTransport, TcpTransportListener, TcpTransportStream};
pub use traits::{BoxedStream, DiscoveredPeer, Transport, TransportListener, TransportStream};

#[cfg(feature = "rfcomm")]
pub use bt_discovery::{BtDiscovery, DiscoveryConfig};
#[cfg(feature = "rfcomm")]
pub use rfcomm::{RfcommConfig, RfcommListener, RfcommTransport, RfcommTransportStream};
