//! director-cloud — the contracts the director drives infrastructure through.
//!
//! [`Cpi`] creates and deletes VMs and disks; [`Agent`] configures and
//! starts the jobs on a VM. Real implementations live outside this
//! repository. [`DummyCloud`] keeps everything in memory for tests and
//! dev mode.

pub mod agent;
pub mod cpi;
pub mod dummy;
pub mod error;

pub use agent::{Agent, AgentState};
pub use cpi::{Cpi, CpiRegistry, CreateVmRequest};
pub use dummy::DummyCloud;
pub use error::{CloudError, CloudResult};
