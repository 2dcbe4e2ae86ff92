//! Durable workflow engine: instance store, locks, timers, the notification
//! bus and the state machine that drives workflow instances.

pub mod bus;
pub mod db;
pub mod engine;
pub mod functions;
pub mod ingress;
pub mod lock;
pub mod migrations;
pub mod registry;
pub mod states;
pub mod store;
pub mod timers;

pub use bus::{Bus, MemoryTransport, PgTransport, Transport};
pub use db::Database;
pub use engine::{Engine, InstanceMemory, NewInstanceArgs};
pub use functions::{FunctionInvoker, FunctionRequest, HttpFunctionInvoker};
pub use lock::{AdvisoryLocks, LockManager, MemoryAdvisoryLocks, PgAdvisoryLocks};
pub use migrations::{builtin_migrations, MigrationRunner};
pub use store::{InstanceStore, MemoryStore, PgStore};
pub use timers::TimerService;
