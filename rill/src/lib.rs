pub mod asm;
mod builder;
pub mod builtins;
mod calls;
mod class;
mod context;
mod copy;
mod entity;
mod error;
mod function;
mod heap;
mod interning;
pub mod interpreter;
mod machine;
mod module;
mod modules;
mod native;
mod object;
pub mod ops;
mod pool;
mod process;
pub mod reflect;
mod registry;
pub mod scheduler;
mod tape;
mod task;
mod vm;

pub use builder::{Label, TapeBuilder};
pub use calls::CallOutcome;
pub use class::*;
pub use context::*;
pub use copy::EntityCopier;
pub use entity::*;
pub use error::*;
pub use function::*;
pub use heap::*;
pub use interning::{InternedId, InternedStrings, WellKnown};
pub use machine::{Machine, TraceLine};
pub use module::*;
pub use modules::ModuleManager;
pub use native::*;
pub use object::*;
pub use pool::{BackgroundPool, Job, PoolCreateInfo, ScaleConfig, WorkerId};
pub use process::*;
pub use registry::*;
pub use tape::*;
pub use task::*;
pub use vm::*;
