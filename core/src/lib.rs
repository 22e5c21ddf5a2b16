pub mod perf;
pub mod registry;
pub mod rt;
pub mod util;
pub mod val;

// Execution engine: frames, callables, references and the trampoline
pub mod vm;
