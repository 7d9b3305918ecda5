pub mod backoff;
pub mod dispatch;
pub mod env;
pub mod instruction;

pub use dispatch::{Bot, ConnectionState, FatalError, Flow};
pub use env::Env;
pub use instruction::{ConnectionId, Instruction, InstructionReceiver, InstructionSender};
