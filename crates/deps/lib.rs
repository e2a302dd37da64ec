pub use bevy;
pub use educe;
pub use smallvec;
pub use tracing;
pub use tracing_subscriber;
pub use tracing_unwrap;

pub use bevy::ecs as bevy_ecs;
pub use smallvec::SmallVec as SVec;
pub use tracing_unwrap::*;
