use crate::val::Exception;

use super::FrameId;

/// Outcome of executing one step of a frame.
///
/// The fiber driver inspects the outcome and decides what runs next; nothing in a step
/// ever recurses into another frame on the host stack.
#[derive(Debug)]
#[must_use]
pub enum Step {
    /// Continue with the next step of the current frame.
    Proceed,
    /// A child frame was pushed; switch to it. The caller resumes at its next step
    /// once the child's results are delivered.
    Call(FrameId),
    /// The current frame finished; deliver its pending return values to the caller.
    Return,
    /// Propagate to the nearest guard, then to callers.
    Exception(Exception),
    /// Park the fiber and re-execute the same step when woken.
    Repeat,
    /// Let other fibers in this context run, then continue with the next step.
    Yield,
    /// An unassigned value was needed; surfaces as an unassigned-reference exception.
    Block,
}

impl From<Exception> for Step {
    fn from(e: Exception) -> Self {
        Step::Exception(e)
    }
}

impl Step {
    pub fn is_suspension(&self) -> bool {
        matches!(self, Step::Call(_) | Step::Repeat | Step::Yield | Step::Block)
    }
}
