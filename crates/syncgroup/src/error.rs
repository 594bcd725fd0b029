/// The error reported when a caller gives up waiting because its cancellation fired.
///
/// Errors that carry `Canceled` in their [`source`](std::error::Error::source) chain are
/// recognized as cancellations by [`Funcs`](crate::Funcs), which then ignores them if the
/// function's cancellation token has fired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Returned by a function in a [`Funcs`](crate::Funcs) group to have its result left out of
/// all reporting.
///
/// An ignored result still counts towards the group's all-done signal, but never triggers the
/// first-done, first-ok or first-error signals, and is not passed to the monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, thiserror::Error)]
#[error("ignored result")]
pub struct Ignored;

/// Returns `true` if `err` or any of its sources is [`Canceled`].
pub fn is_canceled(err: &(dyn std::error::Error + 'static)) -> bool {
    find_source::<Canceled>(err)
}

/// Returns `true` if `err` or any of its sources is [`Ignored`].
pub fn is_ignored(err: &(dyn std::error::Error + 'static)) -> bool {
    find_source::<Ignored>(err)
}

fn find_source<E: std::error::Error + 'static>(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(err) = source {
        if err.is::<E>() {
            return true;
        }
        source = err.source();
    }
    false
}
