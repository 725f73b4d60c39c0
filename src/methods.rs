//! Method catalog.
//!
//! The catalog is partitioned into the versioned stable baseline, the
//! unstable superset, and this project's extensions. The extension set is
//! enumerated explicitly and never merges into the upstream baselines.

pub const INITIALIZE: &str = "initialize";
pub const AUTHENTICATE: &str = "authenticate";
pub const SESSION_NEW: &str = "session/new";
pub const SESSION_LOAD: &str = "session/load";
pub const SESSION_PROMPT: &str = "session/prompt";
pub const SESSION_CANCEL: &str = "session/cancel";
pub const SESSION_UPDATE: &str = "session/update";
pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";
pub const SESSION_SET_MODE: &str = "session/set_mode";
pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";

pub const SESSION_LIST: &str = "session/list";
pub const SESSION_FORK: &str = "session/fork";
pub const SESSION_SET_MODEL: &str = "session/set_model";
pub const SESSION_SET_CONFIG_OPTION: &str = "session/set_config_option";
pub const TERMINAL_CREATE: &str = "terminal/create";
pub const TERMINAL_OUTPUT: &str = "terminal/output";
pub const TERMINAL_KILL: &str = "terminal/kill";

pub const SESSION_STOP: &str = "session/stop";
pub const SESSION_DELETE: &str = "session/delete";
pub const SESSION_EXPORT: &str = "session/export";
pub const LOGOUT: &str = "logout";
pub const CANCEL_REQUEST: &str = "request/cancel";

/// The versioned stable baseline.
pub const STABLE: &[&str] = &[
    INITIALIZE,
    AUTHENTICATE,
    SESSION_NEW,
    SESSION_LOAD,
    SESSION_PROMPT,
    SESSION_CANCEL,
    SESSION_UPDATE,
    SESSION_REQUEST_PERMISSION,
    SESSION_SET_MODE,
    FS_READ_TEXT_FILE,
    FS_WRITE_TEXT_FILE,
];

/// Methods only available when the unstable capability is enabled.
pub const UNSTABLE_ONLY: &[&str] = &[
    SESSION_LIST,
    SESSION_FORK,
    SESSION_SET_MODEL,
    SESSION_SET_CONFIG_OPTION,
    TERMINAL_CREATE,
    TERMINAL_OUTPUT,
    TERMINAL_KILL,
];

/// Project-specific extensions. Deliberately kept out of both baselines.
pub const EXTENSIONS: &[&str] = &[
    SESSION_STOP,
    SESSION_DELETE,
    SESSION_EXPORT,
    LOGOUT,
    CANCEL_REQUEST,
];

pub fn is_stable(method: &str) -> bool {
    STABLE.contains(&method)
}

/// The unstable superset: stable plus unstable-only methods.
pub fn is_unstable(method: &str) -> bool {
    is_stable(method) || UNSTABLE_ONLY.contains(&method)
}

pub fn is_extension(method: &str) -> bool {
    EXTENSIONS.contains(&method)
}

pub fn is_known(method: &str) -> bool {
    is_unstable(method) || is_extension(method)
}
