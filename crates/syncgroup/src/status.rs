/// How a grouped call obtained its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// The caller left before a result was available to it.
    Canceled,
    /// The result comes from this caller's own callback and nobody else waited for it.
    Exclusive,
    /// The result is shared with other callers of the group, or was produced by one of them.
    Shared,
}

impl Status {
    pub fn is_canceled(self) -> bool {
        self == Status::Canceled
    }

    /// The tag used when reporting this status in metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Canceled => "canceled",
            Status::Exclusive => "exclusive",
            Status::Shared => "shared",
        }
    }
}
