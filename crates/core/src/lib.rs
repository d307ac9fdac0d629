pub mod error;
pub mod hlc;
pub mod patch;
pub mod peer;
pub mod session;
pub mod value;
pub mod wire;

pub use error::CoreError;
pub use hlc::{Hlc, HlcClock, SystemClock, WallClock, HLC_EPOCH_MS};
pub use patch::{Delta, Patch, STATS_TABLE};
pub use peer::{PeerId, PeerStats};
pub use session::{Backoff, SessionToken};
pub use value::Value;
pub use wire::{Message, MissingPatchRequest, Ping};
