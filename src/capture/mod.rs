// Capture lifecycle coordination
//
// The coordinator brackets target execution with enable/disable transitions
// on the kernel tracing facility and drains the raw fault stream to disk.
// The facility is reached only through `ControlSurface`, so the state machine
// runs unchanged against tracefs or an in-memory surface.

mod control;
mod coordinator;

pub use control::{
    ControlSurface, Knob, MemorySurface, Tracefs, PROBE_DEFINITIONS, PROBE_GROUP, SESSION_LOCK_PATH,
};
pub use coordinator::{
    drain_lines, CaptureCoordinator, CaptureSignal, CaptureState, CaptureSummary,
    LifecycleViolation, Transition,
};
