//! 计划层：指令、动作步骤、计划、单步结果，以及已知动作类型注册表

pub mod registry;
pub mod types;

pub use registry::{CandidateStep, KindRegistry};
pub use types::{
    normalize_text, ActionKind, ActionStep, Instruction, InstructionContext, Parameters, Plan,
    StepResult,
};
