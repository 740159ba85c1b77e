pub mod debounce;
pub mod engine;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod supervisor;
pub mod timers;
pub mod tubes;
pub mod view;

pub use debounce::{Control, DebounceScheduler};
pub use engine::{ConnectionStatus, SyncEngine, UserIntent};
pub use queue::CommandQueue;
pub use reconcile::{PendingIntent, PendingIntents, PendingTubeSave};
pub use store::{DeviceStore, InputOption};
pub use supervisor::ConnectionState;
pub use timers::{TimerPurpose, TimerRegistry, TimerScope};
pub use tubes::{DeleteOutcome, TubeDraft, TubeSync};
pub use view::EngineView;
