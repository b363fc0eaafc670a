use crate::status::types::StatusCode;

/// Something that knows the user's current presence.
///
/// Polled once per orchestrator tick, so implementations must be cheap. When nothing new can be
/// said, return [`StatusCode::Unknown`] instead of failing.
pub trait StatusSource: Send {
    fn current_status(&mut self) -> StatusCode;
}

impl<F> StatusSource for F
where
    F: FnMut() -> StatusCode + Send,
{
    fn current_status(&mut self) -> StatusCode {
        self()
    }
}
