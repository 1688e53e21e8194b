// src/constants.rs

/// Framework-reserved phase: runs before everything else. Must be present,
/// by value, in any custom phase order.
pub const PHASE_SETUP: &str = "setup";

/// Phase for removal/cleanup work that must precede the main execution.
pub const PHASE_CLEANUP: &str = "cleanup";

/// The default phase for commands that do not declare one.
pub const PHASE_EXECUTION: &str = "execution";

/// Framework-reserved phase: runs after the main execution. Must be present,
/// by value, in any custom phase order.
pub const PHASE_TEARDOWN: &str = "teardown";

/// Final phase, after teardown.
pub const PHASE_END: &str = "end";

/// The built-in phase order used when the host does not supply one.
pub const DEFAULT_PHASE_ORDER: &[&str] = &[
    PHASE_SETUP,
    PHASE_CLEANUP,
    PHASE_EXECUTION,
    PHASE_TEARDOWN,
    PHASE_END,
];

/// Phases that framework-level commands are bound to; a custom phase order
/// that omits one of these fails to construct.
pub const RESERVED_PHASES: &[&str] = &[PHASE_SETUP, PHASE_TEARDOWN];

/// Maximum depth of nested cycle chains unless the host overrides it.
pub const DEFAULT_MAX_CYCLE_DEPTH: u32 = 5;

/// Separator used by `join` on string parameters that do not declare one.
pub const DEFAULT_JOIN_SEPARATOR: &str = " ";
