pub mod cadence;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod process_probe;
pub mod relay;
pub mod run_record;
pub mod settings;
pub mod shutdown;
pub mod supervisor;
pub mod tail;
pub mod user_message;
pub mod window;

pub use coordinator::{MonitorSpec, MultiServerCoordinator};
pub use error::SupervisorError;
pub use relay::{MessageRelay, RelayConsumer, RelaySender};
pub use supervisor::{LaunchSpec, ProcessSupervisor, SupervisorParts};
pub use tail::{BacklogPolicy, LogTailer};
pub use window::WindowLocator;
