// Room membership: local index, cache-aside room reads and the join/leave protocol.

pub mod directory;
pub mod join;
pub mod membership;

pub use directory::RoomDirectory;
pub use join::JoinHandler;
pub use membership::{JoinGuard, JoinStart, MembershipCache};
