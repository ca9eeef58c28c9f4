use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// New type representing a unique `SmolStr` identifier for a data stream that has been
/// subscribed to.
///
/// Used to associate incoming venue messages with the stream they belong to,
/// eg/ `SubscriptionId("@depth5|BTCUSDT")`.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Display,
)]
pub struct SubscriptionId(pub SmolStr);

impl SubscriptionId {
    pub fn new<S>(input: S) -> Self
    where
        S: Into<SmolStr>,
    {
        Self(input.into())
    }
}

impl AsRef<str> for SubscriptionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<S> From<S> for SubscriptionId
where
    S: Into<SmolStr>,
{
    fn from(input: S) -> Self {
        Self::new(input)
    }
}
