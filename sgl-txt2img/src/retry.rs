use log::warn;

/// Maximum number of device fallbacks a single generation may trigger.
pub const DEFAULT_MAX_FALLBACKS: u32 = 1;

/// Bounded "rebuild and retry" policy.
///
/// An attempt that fails with a recoverable error gets the pipelines rebuilt
/// once per allowed fallback and then runs again. Anything else propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    pub max_fallbacks: u32,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            max_fallbacks: DEFAULT_MAX_FALLBACKS,
        }
    }
}

impl FallbackPolicy {
    pub fn new(max_fallbacks: u32) -> Self {
        Self { max_fallbacks }
    }

    /// Policy that never rebuilds.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Run `operation` (invoked with the 0-based attempt index).
    ///
    /// - `recoverable(&err)` decides whether a failure may trigger a fallback.
    /// - `rebuild(&err)` prepares the next attempt. Its error is returned as-is.
    pub fn execute<T, E, Op, Recoverable, Rebuild>(
        &self,
        mut operation: Op,
        recoverable: Recoverable,
        mut rebuild: Rebuild,
    ) -> Result<T, E>
    where
        Op: FnMut(u32) -> Result<T, E>,
        Recoverable: Fn(&E) -> bool,
        Rebuild: FnMut(&E) -> Result<(), E>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match operation(attempt) {
                Ok(val) => return Ok(val),
                Err(err) => err,
            };
            if attempt >= self.max_fallbacks || !recoverable(&err) {
                return Err(err);
            }
            warn!(
                "Attempt {} failed with a recoverable error; rebuilding before retry",
                attempt
            );
            rebuild(&err)?;
            attempt += 1;
        }
    }
}
