//! Configuration options which can alter the behavior of the checks runtime.

/// Policy which is applicable to a [crate::checks::Checks] runtime.
#[derive(Clone, Debug)]
pub struct Policy {
    /// How many requests may wait for the control task before callers
    /// are made to wait.
    pub queue_depth: usize,

    /// Whether `init_file` directives create or rewrite their tracked
    /// file. When false, they are parsed and ignored.
    pub create_init_files: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            create_init_files: true,
        }
    }
}
