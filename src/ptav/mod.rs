//! PTAV（Plan → Tool → Active → Validate）单步迭代控制循环

pub mod events;
pub mod loop_;
pub mod planner;
pub mod validator;

pub use events::PtavEvent;
pub use loop_::{ptav_loop, PtavSession};
pub use planner::{
    fallback_plan, parse_plan, validate_plan, Plan, PlanOutcome, PlanSource, PlanStep, Planner,
    Stage, ACTION_TOOL_CALL,
};
pub use validator::{GoalValidator, ValidationOutcome};
