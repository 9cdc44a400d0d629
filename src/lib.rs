//! Host-side bridge to the rewards web client: serves the bundled client
//! from a loopback HTTP server, exchanges JSON envelopes with it through an
//! embedded browser surface and correlates replies with pending requests.

pub mod config;
pub mod error;
pub mod events;
pub mod layout;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod surface;

pub use config::{BridgeConfig, HostPlatform};
pub use error::{BridgeError, Result};
pub use events::{EventHub, SessionEvent};
pub use layout::{MarginTracker, Margins, ViewportRect};
pub use protocol::{Envelope, UserData};
pub use registry::{PendingReply, PendingRequestRegistry};
pub use server::StaticFileServer;
pub use session::{BridgeSession, SessionPhase, SessionState, UiOperation};
pub use surface::{BrowserSurface, JsonFileStore, KeyValueStore, MemoryStore};
