// Composite agents built on the runtime: a counter, a controller that
// manages child agents, and a supervisor that coordinates two dependent steps

pub mod controller;
pub mod counter;
pub mod supervisor;

pub use controller::{
    ChildLifecycle, ChildPool, ControllerMessage, ControllerReducer, ControllerState,
};
pub use counter::{CounterMessage, CounterReducer, CounterState};
pub use supervisor::{
    ProcessState, Step, SupervisorMessage, SupervisorReducer, SupervisorState, TaskStep,
};
