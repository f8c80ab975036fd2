use crate::Error;

/// Receives transport errors that evaluation calls swallow.
///
/// Implemented for any `Fn(&Error)`:
///
/// ```
/// # use flagpole::ClientConfig;
/// let config = ClientConfig::from_project_token("phc_token").on_error(|err: &flagpole::Error| {
///     eprintln!("feature flags: {err}");
/// });
/// ```
pub trait ErrorHandler {
    /// Called once per failed request.
    fn on_error(&self, error: &Error);
}

pub(crate) struct NoopErrorHandler;
impl ErrorHandler for NoopErrorHandler {
    fn on_error(&self, _error: &Error) {}
}

impl<T: Fn(&Error)> ErrorHandler for T {
    fn on_error(&self, error: &Error) {
        self(error);
    }
}
